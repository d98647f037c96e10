use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::Toolbox;
use crate::checksum;
use crate::target::BuildTarget;

pub(super) fn copy_overlay(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    let Some(overlay) = target.overlay() else {
        info!("no overlay configured");
        return Ok(());
    };
    tools.mount_chroot(target)?;
    let copied = copy_tree(overlay, target.mount_root())?;
    info!(overlay = %overlay.display(), entries = copied, "overlay copied");
    Ok(())
}

pub(super) fn generate_checksum(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    tools
        .resources
        .detach_all(target.image(), target.mount_root())
        .context("detaching image before hashing")?;
    checksum::write_sidecar(target.image(), &target.checksum_path())?;
    Ok(())
}

/// Copies `src` onto `dest`, merging into existing directories, replacing
/// files and recreating symlinks as symlinks. Returns the number of entries.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    if !src.is_dir() {
        anyhow::bail!("overlay '{}' is not a directory", src.display());
    }

    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let to = dest.join(rel);
        let ft = entry.file_type();

        if ft.is_dir() {
            fs::create_dir_all(&to).with_context(|| format!("creating {}", to.display()))?;
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading link {}", entry.path().display()))?;
            remove_existing(&to)?;
            symlink(&link, &to).with_context(|| format!("linking {}", to.display()))?;
        } else {
            if to.is_symlink() {
                remove_existing(&to)?;
            }
            fs::copy(entry.path(), &to).with_context(|| {
                format!("copying {} to {}", entry.path().display(), to.display())
            })?;
        }
        debug!(path = %rel.display(), "overlay entry");
        copied += 1;
    }
    Ok(copied)
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
