use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use super::Toolbox;
use crate::exec::{RunOptions, quote};
use crate::target::BuildTarget;

/// Boot partition end, in MB from the start of the disk.
const BOOT_PARTITION_END_MB: u32 = 64;

pub(super) fn create_image(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    let dir = target.image_dir();
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    tools.runner.run(
        &format!(
            "dd if=/dev/zero of={} bs=1M count={}",
            quote(target.image()),
            target.create_size_mb()
        ),
        &RunOptions::new(),
    )?;
    Ok(())
}

pub(super) fn partition_image(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    let image = quote(target.image());
    let batch = [
        format!("parted {image} --script -- mklabel msdos"),
        format!("parted {image} --script -- mkpart primary fat32 0 {BOOT_PARTITION_END_MB}"),
        format!("parted {image} --script -- mkpart primary ext4 {BOOT_PARTITION_END_MB} -1"),
    ];
    tools.runner.run_batch(&batch, &RunOptions::new())?;
    Ok(())
}

pub(super) fn create_filesystems(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    let parts = tools
        .resources
        .attach_partitions(target.image())
        .context("attaching image partitions")?;
    info!(boot = %parts.boot.display(), root = %parts.root.display(), "formatting partitions");

    let batch = [
        format!("mkfs.vfat {}", quote(&parts.boot)),
        format!("mkfs.ext4 -F {}", quote(&parts.root)),
    ];
    tools.runner.run_batch(&batch, &RunOptions::new())?;
    Ok(())
}
