//! Host checks run before a build touches anything.
//!
//! A missing `kpartx` or `qemu-debootstrap` otherwise shows up as a cryptic
//! shell error in the middle of a stage, possibly after an hour of work.

use crate::error::{BuildError, Result};
use crate::target::KernelMethod;

/// Tools every build needs, as `(command, Debian package)`.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("dd", "coreutils"),
    ("losetup", "mount"),
    ("kpartx", "kpartx"),
    ("parted", "parted"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("qemu-debootstrap", "qemu-user-static"),
    ("debootstrap", "debootstrap"),
    ("chroot", "coreutils"),
];

/// Additional tools for kernels built from source.
pub const KERNEL_BUILD_TOOLS: &[(&str, &str)] = &[
    ("wget", "wget"),
    ("git", "git"),
    ("make", "make"),
    ("tar", "tar"),
    ("unzip", "unzip"),
    ("bc", "bc"),
    ("arm-linux-gnueabihf-gcc", "gcc-arm-linux-gnueabihf"),
];

/// Whether `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// The subset of `tools` that cannot be found.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .copied()
        .filter(|(tool, _)| !command_exists(tool))
        .collect()
}

/// Tools a build with `kernel` needs.
pub fn tools_for(kernel: KernelMethod) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    if kernel != KernelMethod::Prebuilt {
        tools.extend_from_slice(KERNEL_BUILD_TOOLS);
    }
    tools
}

/// Fails with a list of missing tools and the packages providing them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);
    if missing.is_empty() {
        return Ok(());
    }
    let list = missing
        .iter()
        .map(|(t, p)| format!("  {t} (install: {p})"))
        .collect::<Vec<_>>()
        .join("\n");
    Err(BuildError::Precondition(format!(
        "missing required host tools:\n{list}"
    )))
}

/// Loop devices, mounts and chroots all need root.
pub fn check_root() -> Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(BuildError::Precondition(
            "this operation needs root privileges; rerun with sudo".into(),
        ))
    }
}
