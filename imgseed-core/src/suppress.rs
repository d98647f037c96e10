//! Keeps packages installed inside the target root from starting services.
//!
//! Debian maintainer scripts ask `invoke-rc.d` to start daemons after
//! installation, which inside a build chroot would start them on the build
//! host. While a [`DaemonSuppression`] guard is held, `policy-rc.d` rejects
//! every start request and `invoke-rc.d` is diverted to `/bin/true`.
//!
//! Guards are ownership based, not reference counted: a guard engaged while
//! suppression is already in place owns nothing and restores nothing. Strictly
//! nested guards therefore compose, but releasing an outer guard while an
//! inner one is still expected to be active re-enables daemons early.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};
use crate::exec::{CommandRunner, RunOptions};

/// Policy script location, relative to the chroot root.
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
const INVOKE_RC_D: &str = "usr/sbin/invoke-rc.d";
const POLICY_BODY: &str = "#!/bin/sh\nexit 101\n";
const DIVERT_ADD: &str =
    "dpkg-divert --add --local --divert /usr/sbin/invoke-rc.d.chroot --rename /usr/sbin/invoke-rc.d";
const DIVERT_REMOVE: &str = "dpkg-divert --remove --rename /usr/sbin/invoke-rc.d";

/// Scoped daemon suppression for one chroot.
///
/// Call [`DaemonSuppression::release`] to restore and observe errors; dropping
/// an unreleased guard restores on a best-effort basis.
pub struct DaemonSuppression<'a> {
    root: PathBuf,
    runner: &'a dyn CommandRunner,
    owns_policy: bool,
    diverted: bool,
}

impl<'a> DaemonSuppression<'a> {
    /// Suppresses daemons in `root` unless something already did.
    pub fn engage(root: &Path, runner: &'a dyn CommandRunner) -> Result<Self> {
        let mut guard = Self {
            root: root.to_path_buf(),
            runner,
            owns_policy: false,
            diverted: false,
        };

        let policy = root.join(POLICY_RC_D);
        if policy.exists() {
            debug!(root = %root.display(), "daemons already suppressed in chroot");
            return Ok(guard);
        }

        info!(root = %root.display(), "suppressing daemons in chroot");
        if let Some(dir) = policy.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| BuildError::io(format!("creating {}", dir.display()), e))?;
        }
        fs::write(&policy, POLICY_BODY)
            .map_err(|e| BuildError::io(format!("writing {}", policy.display()), e))?;
        fs::set_permissions(&policy, fs::Permissions::from_mode(0o755))
            .map_err(|e| BuildError::io(format!("chmod {}", policy.display()), e))?;
        guard.owns_policy = true;

        runner.run(DIVERT_ADD, &chroot_opts(root))?;
        guard.diverted = true;

        let noop = root.join("bin/true");
        let invoke = root.join(INVOKE_RC_D);
        fs::copy(&noop, &invoke).map_err(|e| {
            BuildError::io(
                format!("copying {} to {}", noop.display(), invoke.display()),
                e,
            )
        })?;

        Ok(guard)
    }

    /// Whether this guard installed the suppression it will remove.
    pub fn is_owner(&self) -> bool {
        self.owns_policy
    }

    /// Undoes exactly what [`DaemonSuppression::engage`] applied.
    pub fn release(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if !self.owns_policy {
            return Ok(());
        }
        info!(root = %self.root.display(), "re-enabling daemons in chroot");

        remove_if_present(&self.root.join(POLICY_RC_D))?;
        self.owns_policy = false;

        if self.diverted {
            remove_if_present(&self.root.join(INVOKE_RC_D))?;
            self.runner.run(DIVERT_REMOVE, &chroot_opts(&self.root))?;
            self.diverted = false;
        }
        Ok(())
    }
}

impl Drop for DaemonSuppression<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(root = %self.root.display(), error = %e, "failed to re-enable daemons in chroot");
        }
    }
}

fn chroot_opts(root: &Path) -> RunOptions {
    RunOptions::new().env([("LANG", "C")]).chroot(root)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(format!("removing {}", path.display()), e)),
    }
}
