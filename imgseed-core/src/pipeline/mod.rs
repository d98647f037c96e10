//! The standard Raspberry Pi 2 image build.
//!
//! Each stage body takes the [`BuildTarget`] and either finishes its step or
//! fails; recording progress is the orchestrator's job. Bodies reacquire the
//! loop device and mounts they need on entry, since a resumed build starts
//! from a fresh process.

mod files;
mod finish;
mod image;
mod kernel;
mod rootfs;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::exec::CommandRunner;
use crate::resources::Resources;
use crate::stage::StageRegistry;
use crate::target::BuildTarget;

pub use files::{write_file, WriteOptions};

/// Environment for package management inside the chroot.
pub const CHROOT_ENV: [(&str, &str); 2] = [("LANG", "C"), ("DEBIAN_FRONTEND", "noninteractive")];

/// What stage bodies act through.
#[derive(Clone)]
pub struct Toolbox {
    pub runner: Arc<dyn CommandRunner>,
    pub resources: Arc<Resources>,
}

impl Toolbox {
    pub fn new(runner: Arc<dyn CommandRunner>, resources: Arc<Resources>) -> Self {
        Self { runner, resources }
    }

    /// Attaches the image and mounts the chroot plan.
    pub(crate) fn mount_chroot(&self, target: &BuildTarget) -> anyhow::Result<()> {
        self.resources
            .attach_all(target.image(), target.mount_root())
            .with_context(|| format!("mounting {}", target.image().display()))?;
        Ok(())
    }
}

/// The eight stages of a full build, in order.
pub fn standard_stages(tools: Toolbox) -> StageRegistry {
    let t = Arc::new(tools);
    let stage = |f: fn(&Toolbox, &BuildTarget) -> anyhow::Result<()>| {
        let t = Arc::clone(&t);
        move |target: &BuildTarget| f(&t, target)
    };

    StageRegistry::new()
        .stage(
            "create_image",
            "allocate a zero-filled image file",
            stage(image::create_image),
        )
        .stage(
            "partition_image",
            "write an msdos label with a FAT boot and an ext4 root partition",
            stage(image::partition_image),
        )
        .stage(
            "create_filesystems",
            "attach the image and format both partitions",
            stage(image::create_filesystems),
        )
        .stage(
            "bootstrap_first_stage",
            "debootstrap a minimal Debian root",
            stage(rootfs::bootstrap_first_stage),
        )
        .stage(
            "configure_rootfs",
            "configure the root and install base packages in the chroot",
            stage(rootfs::configure_rootfs),
        )
        .stage(
            "install_kernel",
            "install a kernel, firmware and boot configuration",
            stage(kernel::install_kernel),
        )
        .stage(
            "copy_overlay",
            "copy the overlay directory onto the root",
            stage(finish::copy_overlay),
        )
        .stage(
            "generate_checksum",
            "detach the image and write its SHA-1 sidecar",
            stage(finish::generate_checksum),
        )
}

/// Joins an absolute in-image path like `/etc/hosts` onto the mount root.
pub(crate) fn in_root(target: &BuildTarget, path: &str) -> std::path::PathBuf {
    target.mount_root().join(Path::new(path.trim_start_matches('/')))
}
