//! Mount specifications and the live mount table.

use std::fmt;
use std::path::{Path, PathBuf};

/// Where the boot partition is mounted, relative to the root mountpoint.
pub const BOOT_FIRMWARE_DIR: &str = "boot/firmware";

/// One entry of a mount plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: Option<String>,
    pub options: Option<String>,
}

impl MountSpec {
    pub fn new(device: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            mountpoint: mountpoint.into(),
            fstype: None,
            options: None,
        }
    }

    pub fn fstype(mut self, fstype: &str) -> Self {
        self.fstype = Some(fstype.to_string());
        self
    }

    pub fn options(mut self, options: &str) -> Self {
        self.options = Some(options.to_string());
        self
    }

    /// Whether this entry is a bind mount of an existing directory.
    pub fn is_bind(&self) -> bool {
        self.options
            .as_deref()
            .is_some_and(|o| o.split(',').any(|opt| opt == "bind" || opt == "rbind"))
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.device, self.mountpoint.display())?;
        if let Some(t) = &self.fstype {
            write!(f, " type {t}")?;
        }
        if let Some(o) = &self.options {
            write!(f, " ({o})")?;
        }
        Ok(())
    }
}

/// The mounts a chroot into the image needs, in mount order.
///
/// Later entries live underneath earlier ones (the firmware directory only
/// exists once the root filesystem is mounted), so the order must be kept;
/// unmounting walks the list backwards.
pub fn chroot_mounts(root_dev: &str, boot_dev: &str, mountpoint: &Path) -> Vec<MountSpec> {
    vec![
        MountSpec::new(root_dev, mountpoint).fstype("ext4"),
        MountSpec::new(boot_dev, mountpoint.join(BOOT_FIRMWARE_DIR)).fstype("vfat"),
        MountSpec::new("proc", mountpoint.join("proc")).fstype("proc"),
        MountSpec::new("/dev", mountpoint.join("dev")).options("bind"),
        MountSpec::new("/dev/pts", mountpoint.join("dev/pts")).options("bind"),
    ]
}

/// Mountpoints of [`chroot_mounts`] in mount order. Unmounting needs no
/// device names, so this works before the partitions have been found.
pub fn chroot_mountpoints(mountpoint: &Path) -> Vec<PathBuf> {
    chroot_mounts("", "", mountpoint)
        .into_iter()
        .map(|m| m.mountpoint)
        .collect()
}

/// A line of the kernel mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Parses `/proc/self/mounts` (or `/etc/mtab`) content.
///
/// Malformed lines are skipped. Octal escapes the kernel uses for whitespace
/// and backslashes in paths (`\040`, `\011`, `\012`, `\134`) are decoded.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// The entry most recently mounted on `mountpoint`, if any.
pub fn mounted_at<'a>(table: &'a [MountEntry], mountpoint: &Path) -> Option<&'a MountEntry> {
    table.iter().rev().find(|e| e.target == mountpoint)
}

fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
