//! Kernel, device tree and firmware for the boot partition.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::{CHROOT_ENV, Toolbox, WriteOptions, in_root, write_file};
use crate::exec::{RunOptions, quote};
use crate::mounts::BOOT_FIRMWARE_DIR;
use crate::target::{BuildTarget, KernelMethod};

/// A kernel tree that can be downloaded and cross-compiled.
struct KernelSource {
    url: &'static str,
    folder: &'static str,
    extract: &'static str,
}

const MAINLINE: KernelSource = KernelSource {
    url: "https://www.kernel.org/pub/linux/kernel/v4.x/linux-4.0.tar.xz",
    folder: "linux-4.0",
    extract: "tar xf",
};

const RPI: KernelSource = KernelSource {
    url: "https://github.com/raspberrypi/linux/archive/rpi-3.18.y.zip",
    folder: "linux-rpi-3.18.y",
    extract: "unzip",
};

const DEFCONFIG: &str = "bcm2709_defconfig";
const DEFCONFIG_URL: &str =
    "https://raw.githubusercontent.com/raspberrypi/linux/rpi-3.18.y/arch/arm/configs/bcm2709_defconfig";
const DTS_URL: &str =
    "https://raw.githubusercontent.com/raspberrypi/linux/rpi-3.18.y/arch/arm/boot/dts/bcm2709-rpi-2-b.dts";
const DTB_NAME: &str = "bcm2709-rpi-2-b.dtb";
const FIRMWARE_REPO: &str = "https://github.com/raspberrypi/firmware.git";

const CROSS_ENV: [(&str, &str); 2] = [("ARCH", "arm"), ("CROSS_COMPILE", "arm-linux-gnueabihf-")];

const VENDOR_SOURCES: &[&str] = &[
    "deb https://repositories.collabora.co.uk/debian/ jessie rpi2",
    "deb http://ftp.debian.org/debian experimental main",
];
const VENDOR_KERNEL_PACKAGE: &str = "linux-image-3.18.0-trunk-rpi2";

const PREBUILT_CMDLINE: &str = "dwc_otg.lpm_enable=0 console=ttyAMA0,115200 root=/dev/mmcblk0p2 rootfstype=ext4 elevator=deadline rootwait";
const COMPILED_CMDLINE: &str = "dwc_otg.fiq_fix_enable=1 console=ttyAMA0,115200 console=tty1 root=/dev/mmcblk0p2 rootfstype=ext4 rootwait ro rootflags=noload";

pub(super) fn install_kernel(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    match target.kernel() {
        KernelMethod::Prebuilt => install_prebuilt(tools, target),
        KernelMethod::Mainline => build_and_install(tools, target, &MAINLINE),
        KernelMethod::Rpi => build_and_install(tools, target, &RPI),
    }
}

fn firmware_dir(target: &BuildTarget) -> PathBuf {
    in_root(target, BOOT_FIRMWARE_DIR)
}

fn install_prebuilt(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    tools.mount_chroot(target)?;
    write_file(
        &in_root(target, "/etc/apt/sources.list"),
        VENDOR_SOURCES,
        WriteOptions::append().unique_only().mode(0o644),
    )?;

    let batch = [
        "apt-get update".to_string(),
        "apt-get install -y --force-yes collabora-obs-archive-keyring".to_string(),
        "apt-get update".to_string(),
        "apt-get -y -t experimental install linux-kbuild-3.18".to_string(),
        format!(
            "apt-get install -y --force-yes raspberrypi-bootloader-nokernel {VENDOR_KERNEL_PACKAGE} linux-headers-3.18.0-trunk-rpi2"
        ),
    ];
    tools.runner.run_batch(
        &batch,
        &RunOptions::new()
            .env(CHROOT_ENV)
            .chroot(target.mount_root())
            .suppress_daemons(),
    )?;

    // Chroot scripts echo every line, so query through a plain chroot call
    // to get clean output.
    let listing = tools.runner.run(
        &format!(
            "chroot {} dpkg-query -L {VENDOR_KERNEL_PACKAGE} | grep vmlinuz",
            quote(target.mount_root())
        ),
        &RunOptions::new().env(CHROOT_ENV),
    )?;
    let vmlinuz = listing
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .with_context(|| format!("{VENDOR_KERNEL_PACKAGE} ships no vmlinuz"))?;

    copy(&in_root(target, vmlinuz), &firmware_dir(target).join("kernel7.img"))?;
    write_file(
        &firmware_dir(target).join("cmdline.txt"),
        &[PREBUILT_CMDLINE],
        WriteOptions::overwrite(),
    )?;
    Ok(())
}

fn build_and_install(tools: &Toolbox, target: &BuildTarget, src: &KernelSource) -> Result<()> {
    let kdir = fetch_sources(tools, target.work_dir(), src)?;
    compile(tools, &kdir)?;

    tools.mount_chroot(target)?;
    let cross = RunOptions::new().env(CROSS_ENV).cwd(&kdir);
    tools.runner.run(
        &format!("make modules_install INSTALL_MOD_PATH={}", quote(target.mount_root())),
        &cross,
    )?;

    let boot = kdir.join("arch/arm/boot");
    let fw = firmware_dir(target);
    copy(&boot.join("zImage"), &fw.join("kernel7.img"))?;
    copy(&boot.join("dts").join(DTB_NAME), &fw.join(DTB_NAME))?;

    let firmware_repo = target.work_dir().join("raspberrypi-firmware");
    tools.runner.run(
        &format!("cp -rf {}/boot/* {}", quote(&firmware_repo), quote(&fw)),
        &RunOptions::new(),
    )?;

    write_file(&fw.join("cmdline.txt"), &[COMPILED_CMDLINE], WriteOptions::overwrite())?;
    write_file(&fw.join("config.txt"), &["gpu_mem=16"], WriteOptions::overwrite())?;
    Ok(())
}

/// Downloads whatever of the kernel tree, defconfig, device tree and firmware
/// is not in `work_dir` yet. Returns the kernel tree.
fn fetch_sources(tools: &Toolbox, work_dir: &Path, src: &KernelSource) -> Result<PathBuf> {
    fs::create_dir_all(work_dir).with_context(|| format!("creating {}", work_dir.display()))?;
    let in_work = RunOptions::new().cwd(work_dir);

    let kdir = work_dir.join(src.folder);
    if !kdir.exists() {
        let archive = file_name(src.url);
        if !work_dir.join(archive).exists() {
            tools.runner.run(&format!("wget {}", quote(src.url)), &in_work)?;
        }
        tools
            .runner
            .run(&format!("{} {}", src.extract, quote(archive)), &in_work)?;
    }

    let configs = kdir.join("arch/arm/configs");
    if !configs.join(DEFCONFIG).exists() {
        tools
            .runner
            .run(&format!("wget {}", quote(DEFCONFIG_URL)), &RunOptions::new().cwd(&configs))?;
    }

    let dts = kdir.join("arch/arm/boot/dts");
    if !dts.join(file_name(DTS_URL)).exists() {
        tools
            .runner
            .run(&format!("wget {}", quote(DTS_URL)), &RunOptions::new().cwd(&dts))?;
    }

    let firmware = work_dir.join("raspberrypi-firmware");
    if !firmware.exists() {
        tools.runner.run(
            &format!("git clone --depth 1 {FIRMWARE_REPO} {}", quote(&firmware)),
            &in_work,
        )?;
    }
    Ok(kdir)
}

/// Cross-compiles the kernel and device tree unless both outputs exist.
fn compile(tools: &Toolbox, kdir: &Path) -> Result<()> {
    let boot = kdir.join("arch/arm/boot");
    if boot.join("zImage").exists() && boot.join("dts").join(DTB_NAME).exists() {
        info!(kdir = %kdir.display(), "kernel already built");
        return Ok(());
    }

    let batch = [format!("make {DEFCONFIG}"), format!("make -j{}", make_jobs())];
    tools
        .runner
        .run_batch(&batch, &RunOptions::new().env(CROSS_ENV).cwd(kdir))?;
    Ok(())
}

/// One and a half jobs per CPU.
fn make_jobs() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus * 3 / 2).max(1)
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn copy(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    Ok(())
}
