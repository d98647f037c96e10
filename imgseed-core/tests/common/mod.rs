#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use imgseed_core::error::{BuildError, Result};
use imgseed_core::exec::{CommandRunner, RunOptions};
use imgseed_core::host::Host;
use imgseed_core::mounts::{MountEntry, MountSpec};
use imgseed_core::target::{BuildTarget, BuildTargetOptions, MIN_SIZE_MB};

/// In-memory loop registry and mount table.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

#[derive(Default)]
pub struct State {
    pub loops: Vec<(PathBuf, PathBuf)>,
    pub next_loop: u32,
    pub mapped: HashSet<String>,
    /// Probes of a partition node that fail before it shows up.
    pub node_lag: u32,
    pub node_probes: u32,
    pub table: Vec<MountEntry>,
    pub events: Vec<String>,
    pub busy: HashSet<PathBuf>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Registers an existing binding as if a previous run left it behind.
    pub fn add_stale_loop(&self, image: &Path) -> PathBuf {
        let mut s = self.state();
        let device = PathBuf::from(format!("/dev/loop{}", s.next_loop));
        s.next_loop += 1;
        s.loops.push((image.to_path_buf(), device.clone()));
        device
    }

    pub fn add_mount(&self, source: &str, target: &Path) {
        self.state().table.push(MountEntry {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: "ext4".into(),
            options: "rw".into(),
        });
    }

    pub fn loops_for(&self, image: &Path) -> Vec<PathBuf> {
        self.state()
            .loops
            .iter()
            .filter(|(i, _)| i == image)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().table.iter().map(|e| e.target.clone()).collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }
}

impl Host for FakeHost {
    fn loop_devices(&self, image: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.loops_for(image))
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let device = self.add_stale_loop(image);
        self.state().events.push(format!("attach {}", device.display()));
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        let mut s = self.state();
        s.loops.retain(|(_, d)| d != device);
        if let Some(name) = device.file_name() {
            s.mapped.remove(&*name.to_string_lossy());
        }
        s.events.push(format!("detach {}", device.display()));
        Ok(())
    }

    fn map_partitions(&self, device: &Path) -> Result<String> {
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.state().mapped.insert(name.clone());
        Ok(name)
    }

    fn node_exists(&self, node: &Path) -> bool {
        let mut s = self.state();
        s.node_probes += 1;
        if s.node_probes <= s.node_lag {
            return false;
        }
        let node = node.to_string_lossy();
        s.mapped.iter().any(|name| {
            node == format!("/dev/mapper/{name}p1") || node == format!("/dev/mapper/{name}p2")
        })
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        Ok(self.state().table.clone())
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        let mut s = self.state();
        s.table.push(MountEntry {
            source: spec.device.clone(),
            target: spec.mountpoint.clone(),
            fstype: spec.fstype.clone().unwrap_or_else(|| "none".into()),
            options: spec.options.clone().unwrap_or_else(|| "rw".into()),
        });
        s.events.push(format!("mount {}", spec.mountpoint.display()));
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let mut s = self.state();
        if s.busy.contains(mountpoint) {
            return Err(BuildError::Io {
                context: format!("unmounting {}", mountpoint.display()),
                source: io::Error::other("target is busy"),
            });
        }
        if let Some(pos) = s.table.iter().rposition(|e| e.target == mountpoint) {
            s.table.remove(pos);
        }
        s.events.push(format!("umount {}", mountpoint.display()));
        Ok(())
    }

    fn holders(&self, _mountpoint: &Path) -> Vec<String> {
        vec!["4242 (bash)".to_string()]
    }
}

/// Records commands instead of running them.
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: Mutex<Vec<(String, Option<PathBuf>)>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run_batch(&self, commands: &[String], opts: &RunOptions) -> Result<String> {
        let mut log = self.commands.lock().unwrap();
        for c in commands {
            log.push((c.clone(), opts.chroot_root().map(Path::to_path_buf)));
        }
        Ok(String::new())
    }
}

/// A sparse image of the minimum size, with `status` recorded next to it.
pub fn existing_image(dir: &Path, status: Option<&str>) -> BuildTarget {
    let image = dir.join("seed.img");
    fs::File::create(&image)
        .unwrap()
        .set_len(MIN_SIZE_MB * 1024 * 1024)
        .unwrap();
    let target = BuildTarget::new(BuildTargetOptions::new(&image)).unwrap();
    if let Some(status) = status {
        fs::write(target.status_path(), status).unwrap();
    }
    target
}

pub fn fresh_target(dir: &Path) -> BuildTarget {
    BuildTarget::new(BuildTargetOptions::new(dir.join("seed.img"))).unwrap()
}
