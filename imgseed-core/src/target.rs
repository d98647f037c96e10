//! The image being built and everything derived from its path.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::error::{BuildError, Result};

/// Smallest image a minimal root filesystem plus kernel fits into.
pub const MIN_SIZE_MB: u64 = 1536;
pub const DEFAULT_IMAGE_NAME: &str = "raspseed.img";
pub const DEFAULT_DISTRIBUTION: &str = "sid";
pub const DEFAULT_HOSTNAME: &str = "raspseed";
pub const DEFAULT_ARCH: &str = "armhf";
pub const DEFAULT_MIRROR: &str = "ftp://ftp.debian.org/debian";

const MIB: u64 = 1024 * 1024;

/// How the kernel ends up on the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelMethod {
    /// Packaged kernel and bootloader from a vendor apt repository.
    #[default]
    Prebuilt,
    /// Cross-compiled from a kernel.org release.
    Mainline,
    /// Cross-compiled from the Raspberry Pi Foundation tree.
    Rpi,
}

impl KernelMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelMethod::Prebuilt => "prebuilt",
            KernelMethod::Mainline => "mainline",
            KernelMethod::Rpi => "rpi",
        }
    }
}

impl fmt::Display for KernelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelMethod {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prebuilt" => Ok(KernelMethod::Prebuilt),
            "mainline" => Ok(KernelMethod::Mainline),
            "rpi" => Ok(KernelMethod::Rpi),
            other => Err(BuildError::Precondition(format!(
                "unknown kernel method '{other}' (expected prebuilt, mainline or rpi)"
            ))),
        }
    }
}

/// Caller-supplied settings for a [`BuildTarget`].
#[derive(Clone, Debug)]
pub struct BuildTargetOptions {
    pub image: PathBuf,
    /// Size of a newly created image. An existing image keeps its own size
    /// unless it is overwritten.
    pub size_mb: Option<u64>,
    pub distribution: String,
    pub kernel: KernelMethod,
    pub overlay: Option<PathBuf>,
    pub hostname: String,
    pub arch: String,
    pub mirror: String,
    /// Defaults to `./dependencies`.
    pub work_dir: Option<PathBuf>,
    /// Defaults to `<image>.mnt`.
    pub mount_root: Option<PathBuf>,
}

impl BuildTargetOptions {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            size_mb: None,
            distribution: DEFAULT_DISTRIBUTION.to_string(),
            kernel: KernelMethod::default(),
            overlay: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
            arch: DEFAULT_ARCH.to_string(),
            mirror: DEFAULT_MIRROR.to_string(),
            work_dir: None,
            mount_root: None,
        }
    }
}

/// One provisioning job.
///
/// Building a target only inspects the filesystem; it never creates, changes
/// or removes anything, so it is safe to construct for `info` and `detach`.
/// An existing image of any size is accepted here so that a half-written one
/// can still be detached and purged; [`BuildTarget::ensure_resumable`] checks
/// it before stages run on it.
#[derive(Clone, Debug)]
pub struct BuildTarget {
    image: PathBuf,
    requested_mb: u64,
    existing_mb: Option<u64>,
    mount_root: PathBuf,
    work_dir: PathBuf,
    distribution: String,
    kernel: KernelMethod,
    overlay: Option<PathBuf>,
    hostname: String,
    arch: String,
    mirror: String,
}

impl BuildTarget {
    pub fn new(opts: BuildTargetOptions) -> Result<Self> {
        if opts.image.as_os_str().is_empty() || opts.image.file_name().is_none() {
            return Err(BuildError::Precondition(format!(
                "'{}' is not a usable image path",
                opts.image.display()
            )));
        }
        let image = std::path::absolute(&opts.image)
            .map_err(|e| BuildError::io(format!("resolving {}", opts.image.display()), e))?;

        let requested_mb = opts.size_mb.unwrap_or(MIN_SIZE_MB);
        check_size(requested_mb)?;
        let existing_mb = match fs::metadata(&image) {
            Ok(meta) if meta.is_file() => Some(meta.len() / MIB),
            Ok(_) => {
                return Err(BuildError::Precondition(format!(
                    "'{}' exists and is not a regular file",
                    image.display()
                )));
            }
            Err(_) => None,
        };

        let mount_root = match opts.mount_root {
            Some(dir) => std::path::absolute(&dir)
                .map_err(|e| BuildError::io(format!("resolving {}", dir.display()), e))?,
            None => with_suffix(&image, ".mnt"),
        };
        let work_dir = match opts.work_dir {
            Some(dir) => std::path::absolute(&dir)
                .map_err(|e| BuildError::io(format!("resolving {}", dir.display()), e))?,
            None => std::env::current_dir()
                .map_err(|e| BuildError::io("reading current directory", e))?
                .join("dependencies"),
        };

        let target = Self {
            image,
            requested_mb,
            existing_mb,
            mount_root,
            work_dir,
            distribution: opts.distribution,
            kernel: opts.kernel,
            overlay: opts.overlay,
            hostname: opts.hostname,
            arch: opts.arch,
            mirror: opts.mirror,
        };
        info!(
            image = %target.image.display(),
            size_mb = target.size_mb(),
            existing = existing_mb.is_some(),
            "build target"
        );
        Ok(target)
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn image_dir(&self) -> &Path {
        self.image.parent().unwrap_or(Path::new("/"))
    }

    pub fn image_name(&self) -> String {
        self.image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Size of the image on disk, or the size it will be created with.
    pub fn size_mb(&self) -> u64 {
        self.existing_mb.unwrap_or(self.requested_mb)
    }

    /// Size used when the image is (re)created.
    pub fn create_size_mb(&self) -> u64 {
        self.requested_mb
    }

    /// Fails when an existing image is too small to keep building on.
    pub fn ensure_resumable(&self) -> Result<()> {
        match self.existing_mb {
            Some(mb) if self.image.is_file() => check_size(mb),
            _ => Ok(()),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    pub fn kernel(&self) -> KernelMethod {
        self.kernel
    }

    pub fn overlay(&self) -> Option<&Path> {
        self.overlay.as_deref()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    /// `<image>.status.txt`
    pub fn status_path(&self) -> PathBuf {
        with_suffix(&self.image, ".status.txt")
    }

    /// `<image>.sha1`
    pub fn checksum_path(&self) -> PathBuf {
        with_suffix(&self.image, ".sha1")
    }

    pub fn exists(&self) -> bool {
        self.image.is_file()
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.image.display())?;
        writeln!(f, "  size:         {}MB", self.size_mb())?;
        writeln!(f, "  status file:  {}", self.status_path().display())?;
        writeln!(f, "  mountpoint:   {}", self.mount_root.display())?;
        writeln!(f, "  distribution: {}", self.distribution)?;
        writeln!(f, "  kernel:       {}", self.kernel)?;
        writeln!(f, "  hostname:     {}", self.hostname)?;
        writeln!(f, "  architecture: {}", self.arch)?;
        write!(f, "  mirror:       {}", self.mirror)
    }
}

fn check_size(size_mb: u64) -> Result<()> {
    if size_mb < MIN_SIZE_MB {
        return Err(BuildError::Precondition(format!(
            "image size {size_mb}MB is smaller than the minimum of {MIN_SIZE_MB}MB"
        )));
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn derives_sidecar_paths_from_image() {
        let temp = TempDir::new().unwrap();
        let target =
            BuildTarget::new(BuildTargetOptions::new(temp.path().join("seed.img"))).unwrap();

        assert_eq!(target.status_path(), temp.path().join("seed.img.status.txt"));
        assert_eq!(target.checksum_path(), temp.path().join("seed.img.sha1"));
        assert_eq!(target.mount_root(), temp.path().join("seed.img.mnt"));
        assert_eq!(target.image_name(), "seed.img");
        assert_eq!(target.size_mb(), MIN_SIZE_MB);
        assert_eq!(target.hostname(), DEFAULT_HOSTNAME);
    }

    #[test]
    fn rejects_requested_size_below_minimum() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("small.img");
        let mut opts = BuildTargetOptions::new(&image);
        opts.size_mb = Some(1024);

        let err = BuildTarget::new(opts).unwrap_err();
        assert!(matches!(err, BuildError::Precondition(_)));
        assert!(!image.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn existing_image_keeps_its_size_until_recreated() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("seed.img");
        fs::File::create(&image).unwrap().set_len(2048 * MIB).unwrap();
        let mut opts = BuildTargetOptions::new(&image);
        opts.size_mb = Some(4096);

        let target = BuildTarget::new(opts).unwrap();
        assert_eq!(target.size_mb(), 2048);
        assert_eq!(target.create_size_mb(), 4096);
    }

    #[test]
    fn undersized_existing_image_is_a_target_but_not_resumable() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("seed.img");
        fs::File::create(&image).unwrap().set_len(300 * MIB).unwrap();

        let target = BuildTarget::new(BuildTargetOptions::new(&image)).unwrap();

        assert_eq!(target.size_mb(), 300);
        assert_eq!(target.create_size_mb(), MIN_SIZE_MB);
        assert!(matches!(
            target.ensure_resumable(),
            Err(BuildError::Precondition(_))
        ));
    }

    #[test]
    fn empty_image_path_is_rejected() {
        assert!(matches!(
            BuildTarget::new(BuildTargetOptions::new("")),
            Err(BuildError::Precondition(_))
        ));
        assert!(matches!(
            BuildTarget::new(BuildTargetOptions::new("/")),
            Err(BuildError::Precondition(_))
        ));
    }

    #[test]
    fn explicit_mount_root_is_kept() {
        let temp = TempDir::new().unwrap();
        let mut opts = BuildTargetOptions::new(temp.path().join("seed.img"));
        opts.mount_root = Some(temp.path().join("chroot"));
        let target = BuildTarget::new(opts).unwrap();
        assert_eq!(target.mount_root(), temp.path().join("chroot"));
    }

    #[test]
    fn kernel_method_parses_known_names() {
        assert_eq!("rpi".parse::<KernelMethod>().unwrap(), KernelMethod::Rpi);
        assert_eq!(KernelMethod::Mainline.to_string(), "mainline");
        assert!("sjoerd".parse::<KernelMethod>().is_err());
    }
}
