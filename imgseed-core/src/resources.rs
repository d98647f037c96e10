//! Idempotent acquisition and release of loop devices and mounts.
//!
//! Everything here may be called again after a crash: attaching reuses an
//! existing binding, mounting accepts an occupied mountpoint, and releasing
//! something that is already gone does nothing. State is always rediscovered
//! from the host, never remembered between invocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{BuildError, Result};
use crate::host::Host;
use crate::mounts::{MountSpec, chroot_mountpoints, chroot_mounts, mounted_at};
use crate::poll::{PollPolicy, poll_until};

/// Device nodes of an attached image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partitions {
    pub loop_device: PathBuf,
    /// First partition, FAT.
    pub boot: PathBuf,
    /// Second partition, ext4.
    pub root: PathBuf,
}

pub struct Resources {
    host: Arc<dyn Host>,
    poll: PollPolicy,
    strict_mounts: bool,
}

impl Resources {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            poll: PollPolicy::default(),
            strict_mounts: false,
        }
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Treat a mountpoint occupied by an unexpected source as an error instead
    /// of logging and carrying on.
    pub fn strict_mounts(mut self, strict: bool) -> Self {
        self.strict_mounts = strict;
        self
    }

    /// Returns the loop device backing `image`, attaching one if needed.
    pub fn attach_loopback(&self, image: &Path) -> Result<PathBuf> {
        let existing = self.host.loop_devices(image)?;
        if let Some(first) = existing.first() {
            if existing.len() > 1 {
                warn!(
                    image = %image.display(),
                    devices = ?existing,
                    "image is attached to several loop devices, using the first"
                );
            }
            info!(image = %image.display(), device = %first.display(), "reusing loop device");
            return Ok(first.clone());
        }

        let device = self.host.attach_loop(image)?;
        info!(image = %image.display(), device = %device.display(), "attached image to loop device");
        Ok(device)
    }

    /// Maps the partitions of `loop_device` and waits for both nodes to appear.
    pub fn map_partitions(&self, loop_device: &Path) -> Result<Partitions> {
        let name = self.host.map_partitions(loop_device)?;
        let boot = PathBuf::from(format!("/dev/mapper/{name}p1"));
        let root = PathBuf::from(format!("/dev/mapper/{name}p2"));

        for node in [&boot, &root] {
            let what = node.display().to_string();
            poll_until(&self.poll, &what, || Ok(self.host.node_exists(node).then_some(())))?;
        }

        info!(boot = %boot.display(), root = %root.display(), "partitions mapped");
        Ok(Partitions {
            loop_device: loop_device.to_path_buf(),
            boot,
            root,
        })
    }

    pub fn attach_partitions(&self, image: &Path) -> Result<Partitions> {
        let device = self.attach_loopback(image)?;
        self.map_partitions(&device)
    }

    /// Mounts `spec` unless something is already mounted on its mountpoint.
    pub fn mount(&self, spec: &MountSpec) -> Result<()> {
        let table = self.host.mount_table()?;
        if let Some(entry) = mounted_at(&table, &spec.mountpoint) {
            // Bind mounts show the backing filesystem, not the bound path, so
            // their source cannot be compared.
            if !spec.is_bind() && entry.source != spec.device {
                if self.strict_mounts {
                    return Err(BuildError::ResourceConflict {
                        mountpoint: spec.mountpoint.clone(),
                        expected: spec.device.clone(),
                        found: entry.source.clone(),
                    });
                }
                warn!(
                    mountpoint = %spec.mountpoint.display(),
                    expected = %spec.device,
                    found = %entry.source,
                    "mountpoint already in use by another source, leaving it"
                );
            } else {
                info!(%spec, "already mounted");
            }
            return Ok(());
        }

        self.host.mount(spec)?;
        info!(%spec, "mounted");
        Ok(())
    }

    /// Unmounts `mountpoint` if anything is mounted there.
    pub fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let table = self.host.mount_table()?;
        if mounted_at(&table, mountpoint).is_none() {
            debug!(mountpoint = %mountpoint.display(), "not mounted");
            return Ok(());
        }

        if let Err(e) = self.host.unmount(mountpoint) {
            let holders = self.host.holders(mountpoint);
            if holders.is_empty() {
                error!(mountpoint = %mountpoint.display(), "unmount failed; no process found holding it");
            } else {
                error!(mountpoint = %mountpoint.display(), ?holders, "unmount failed; still in use");
            }
            return Err(e);
        }
        info!(mountpoint = %mountpoint.display(), "unmounted");
        Ok(())
    }

    /// Mounts `specs` in order.
    pub fn mount_all(&self, specs: &[MountSpec]) -> Result<()> {
        specs.iter().try_for_each(|spec| self.mount(spec))
    }

    /// Unmounts the mountpoints of `specs` in reverse order.
    pub fn unmount_all(&self, specs: &[MountSpec]) -> Result<()> {
        specs
            .iter()
            .rev()
            .try_for_each(|spec| self.unmount(&spec.mountpoint))
    }

    /// Attaches `image`, maps its partitions and mounts the chroot plan under
    /// `mount_root`.
    pub fn attach_all(&self, image: &Path, mount_root: &Path) -> Result<Partitions> {
        let parts = self.attach_partitions(image)?;
        let plan = chroot_mounts(
            &parts.root.to_string_lossy(),
            &parts.boot.to_string_lossy(),
            mount_root,
        );
        self.mount_all(&plan)?;
        Ok(parts)
    }

    /// Unmounts the chroot plan under `mount_root` and releases every loop
    /// device backing `image`.
    pub fn detach_all(&self, image: &Path, mount_root: &Path) -> Result<()> {
        for mountpoint in chroot_mountpoints(mount_root).iter().rev() {
            self.unmount(mountpoint)?;
        }

        let devices = self.host.loop_devices(image)?;
        if devices.is_empty() {
            debug!(image = %image.display(), "no loop devices to detach");
        }
        for device in devices {
            info!(device = %device.display(), "detaching loop device");
            self.host.detach_loop(&device)?;
        }
        Ok(())
    }
}
