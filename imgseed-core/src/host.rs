//! Access to host-global state: the loop device registry, device-mapper
//! partition nodes, and the mount table.
//!
//! [`Host`] is deliberately low level and has no idempotence logic of its
//! own; that lives in [`crate::resources`]. [`LinuxHost`] talks to the real
//! system through `losetup`, `kpartx`, `mount(2)` and `/proc`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{BuildError, Result};
use crate::exec::{CommandRunner, RunOptions, quote};
use crate::mounts::{MountEntry, MountSpec, parse_mount_table};

/// Primitive host operations the resource manager is built on.
pub trait Host {
    /// Loop devices currently backed by `image`, in the order the host lists them.
    fn loop_devices(&self, image: &Path) -> Result<Vec<PathBuf>>;

    /// Binds `image` to a free loop device and returns the device path.
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;

    /// Removes partition mappings for `device` and releases it.
    fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Requests partition mappings for `device` and returns the mapping name
    /// (`loop0` for `/dev/mapper/loop0p1`). May return before the nodes exist.
    fn map_partitions(&self, device: &Path) -> Result<String>;

    fn node_exists(&self, node: &Path) -> bool;

    fn mount_table(&self) -> Result<Vec<MountEntry>>;

    /// Mounts `spec`, creating the mountpoint directory if needed.
    fn mount(&self, spec: &MountSpec) -> Result<()>;

    fn unmount(&self, mountpoint: &Path) -> Result<()>;

    /// Human-readable descriptions of processes using `mountpoint`.
    fn holders(&self, mountpoint: &Path) -> Vec<String>;
}

/// The real Linux host.
pub struct LinuxHost {
    runner: Arc<dyn CommandRunner>,
    mount_table: PathBuf,
}

impl LinuxHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            mount_table: PathBuf::from("/proc/self/mounts"),
        }
    }

    fn sh(&self, command: String) -> Result<String> {
        self.runner.run(&command, &RunOptions::new())
    }
}

impl Host for LinuxHost {
    fn loop_devices(&self, image: &Path) -> Result<Vec<PathBuf>> {
        if !image.exists() {
            debug!(image = %image.display(), "no image, so no loop devices");
            return Ok(Vec::new());
        }
        let output = self.sh(format!("losetup --associated {}", quote(image)))?;
        Ok(parse_losetup_associated(&output))
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let output = self.sh(format!("losetup --find --show {}", quote(image)))?;
        let device = output.lines().last().map(str::trim).unwrap_or_default();
        if device.is_empty() {
            return Err(BuildError::ResourceNotFound {
                what: format!("loop device for {}", image.display()),
                attempts: 1,
            });
        }
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        self.sh(format!("kpartx -dv {}", quote(device)))?;
        self.sh(format!("losetup --detach {}", quote(device)))?;
        Ok(())
    }

    fn map_partitions(&self, device: &Path) -> Result<String> {
        let output = self.sh(format!("kpartx -av {}", quote(device)))?;
        if let Some(name) = parse_kpartx_mapping(&output) {
            return Ok(name);
        }
        // kpartx prints nothing when the mappings already exist; its nodes are
        // always named after the loop device.
        device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BuildError::Precondition(format!("bad loop device '{}'", device.display()))
            })
    }

    fn node_exists(&self, node: &Path) -> bool {
        node.exists()
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.mount_table).map_err(|e| {
            BuildError::io(format!("reading {}", self.mount_table.display()), e)
        })?;
        Ok(parse_mount_table(&content))
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        fs::create_dir_all(&spec.mountpoint).map_err(|e| {
            BuildError::io(format!("creating mountpoint {}", spec.mountpoint.display()), e)
        })?;

        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for opt in spec.options.iter().flat_map(|o| o.split(',')) {
            match opt {
                "bind" => flags |= MsFlags::MS_BIND,
                "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                "ro" => flags |= MsFlags::MS_RDONLY,
                "" => {}
                other => data.push(other),
            }
        }
        let data = data.join(",");
        let data = (!data.is_empty()).then_some(data.as_str());

        debug!(%spec, "mount(2)");
        mount(
            Some(spec.device.as_str()),
            spec.mountpoint.as_path(),
            spec.fstype.as_deref(),
            flags,
            data,
        )
        .map_err(|errno| BuildError::io(format!("mounting {spec}"), errno.into()))
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        debug!(mountpoint = %mountpoint.display(), "umount(2)");
        nix::mount::umount(mountpoint).map_err(|errno| {
            BuildError::io(format!("unmounting {}", mountpoint.display()), errno.into())
        })
    }

    fn holders(&self, mountpoint: &Path) -> Vec<String> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cwd(UpdateKind::Always)
                .with_root(UpdateKind::Always)
                .with_exe(UpdateKind::Always),
        );

        let uses = |p: Option<&Path>| p.is_some_and(|p| p.starts_with(mountpoint));
        let mut holders: Vec<String> = sys
            .processes()
            .iter()
            .filter(|(_, proc_)| uses(proc_.cwd()) || uses(proc_.root()) || uses(proc_.exe()))
            .map(|(pid, proc_)| format!("{} ({})", pid, proc_.name().to_string_lossy()))
            .collect();
        holders.sort();
        holders
    }
}

/// Extracts device paths from `losetup --associated` output, e.g.
/// `/dev/loop0: [2049]:1234 (/srv/seed.img)`.
pub fn parse_losetup_associated(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let (device, _) = line.split_once(':')?;
            let device = device.trim();
            device.starts_with("/dev/").then(|| PathBuf::from(device))
        })
        .collect()
}

/// Extracts the mapping name from `kpartx -av` output, e.g.
/// `add map loop2p1 (254:2): 0 125000 linear /dev/loop2 1` yields `loop2`.
pub fn parse_kpartx_mapping(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let name = line.trim().strip_prefix("add map ")?.split_whitespace().next()?;
        let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
        let stem = stem.strip_suffix('p')?;
        (!stem.is_empty()).then(|| stem.to_string())
    })
}
