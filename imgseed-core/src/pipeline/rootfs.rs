use anyhow::Result;

use super::{CHROOT_ENV, Toolbox, WriteOptions, in_root, write_file};
use crate::exec::{RunOptions, quote};
use crate::target::BuildTarget;

const BASE_PACKAGES: &str = "git-core binutils ca-certificates initramfs-tools console-common less nano";
const EXTRA_PACKAGES: &str =
    "apt-transport-https aptitude file openssh-client openssh-server iw usbutils ntp";

const DEBCONF_SELECTIONS: &[&str] = &[
    "console-common console-data/keymap/policy   select      Select keymap from full list",
    "console-common console-data/keymap/full     select      en-latin1-nodeadkeys",
    "locales locales/default_environment_locale  multiselect en_US.UTF-8 UTF-8",
    "locales locales/default_environment_locale  select      en_US.UTF-8",
];

const SERIAL_CONSOLE: &str = "T0:23:respawn:/sbin/agetty -L ttyAMA0 115200 vt100";

const FSTAB: &[&str] = &[
    "/dev/mmcblk0p1  /boot   vfat   ro                0       2",
    "/dev/mmcblk0p2  /       ext4   defaults,noatime  0       1",
];

pub(super) fn bootstrap_first_stage(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    tools.mount_chroot(target)?;
    tools.runner.run(
        &format!(
            "qemu-debootstrap --verbose --arch={} {} {} {}",
            quote(target.arch()),
            quote(target.distribution()),
            quote(target.mount_root()),
            quote(target.mirror()),
        ),
        &RunOptions::new(),
    )?;
    Ok(())
}

pub(super) fn configure_rootfs(tools: &Toolbox, target: &BuildTarget) -> Result<()> {
    tools.mount_chroot(target)?;

    let suite = target.distribution();
    let mirror = target.mirror();
    write_file(
        &in_root(target, "/etc/apt/sources.list"),
        &[
            format!("deb {mirror} {suite} main contrib non-free"),
            format!("deb-src {mirror} {suite} main contrib non-free"),
        ],
        WriteOptions::append().unique_only().mode(0o644),
    )?;

    let hostname = target.hostname();
    write_file(
        &in_root(target, "/etc/hostname"),
        &[hostname],
        WriteOptions::overwrite().mode(0o644),
    )?;
    write_file(
        &in_root(target, "/etc/hosts"),
        &[
            format!("127.0.0.1       {hostname} localhost"),
            "::1             localhost ip6-localhost ip6-loopback".into(),
            "fe00::0         ip6-localnet".into(),
            "ff00::0         ip6-mcastprefix".into(),
            "ff02::1         ip6-allnodes".into(),
            "ff02::2         ip6-allrouters".into(),
        ],
        WriteOptions::overwrite().mode(0o644),
    )?;
    write_file(
        &in_root(target, "/etc/network/interfaces"),
        &["auto lo", "iface lo inet loopback", "auto eth0", "iface eth0 inet dhcp"],
        WriteOptions::overwrite().mode(0o644),
    )?;
    write_file(
        &in_root(target, "/etc/resolv.conf"),
        &["nameserver 8.8.8.8"],
        WriteOptions::overwrite().mode(0o644),
    )?;
    write_file(
        &in_root(target, "/debconf.set"),
        DEBCONF_SELECTIONS,
        WriteOptions::overwrite(),
    )?;

    let batch: Vec<String> = [
        "apt-get update",
        "apt-get -y install locales locales-all debconf-utils",
        "debconf-set-selections /debconf.set",
        "rm -f /debconf.set",
        "apt-get update",
    ]
    .into_iter()
    .map(String::from)
    .chain([
        format!("apt-get -y install {BASE_PACKAGES}"),
        "echo 'root:toor' | chpasswd".into(),
        "rm -f /etc/udev/rules.d/70-persistent-net.rules".into(),
        format!("apt-get -y install {EXTRA_PACKAGES}"),
        "locale-gen".into(),
        "dpkg-reconfigure locales".into(),
        "update-rc.d ssh enable".into(),
        "rm -f /etc/ssh_host_*_key.pub".into(),
        "rm -rf /root/.bash_history".into(),
        "apt-get clean".into(),
    ])
    .collect();
    tools.runner.run_batch(
        &batch,
        &RunOptions::new()
            .env(CHROOT_ENV)
            .chroot(target.mount_root())
            .suppress_daemons(),
    )?;

    write_file(
        &in_root(target, "/etc/inittab"),
        &[SERIAL_CONSOLE],
        WriteOptions::append().unique_only(),
    )?;
    write_file(
        &in_root(target, "/etc/fstab"),
        FSTAB,
        WriteOptions::append().unique_only().mode(0o644),
    )?;
    Ok(())
}
