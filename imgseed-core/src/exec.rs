//! Runs external commands on the host or inside a chroot.
//!
//! Every side effect of the build ends up here: partitioning, formatting,
//! debootstrap, apt. The [`CommandRunner`] trait is the seam other modules
//! depend on; [`Executor`] is the real implementation that shells out.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};
use crate::suppress::DaemonSuppression;

/// Preamble of every script run inside a chroot: stop at the first failing
/// line, pick up the chroot's own `PATH`, and echo each line as it runs.
pub const CHROOT_SCRIPT_PREAMBLE: &[&str] =
    &["#!/bin/bash", "set -e", ". /etc/profile", "set -v"];

/// `PATH` given to commands whose environment is replaced wholesale.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How a command (or batch) should be run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    chroot: Option<PathBuf>,
    suppress_daemons: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inherited environment with exactly these variables.
    pub fn env<K, V, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn chroot(mut self, root: impl Into<PathBuf>) -> Self {
        self.chroot = Some(root.into());
        self
    }

    /// Keep packages installed by this batch from starting services.
    /// Only has an effect together with [`RunOptions::chroot`].
    pub fn suppress_daemons(mut self) -> Self {
        self.suppress_daemons = true;
        self
    }

    pub fn chroot_root(&self) -> Option<&Path> {
        self.chroot.as_deref()
    }

    pub fn environment(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn daemons_suppressed(&self) -> bool {
        self.suppress_daemons
    }
}

/// Something that can run shell command lines.
pub trait CommandRunner {
    /// Runs `commands` in order, stopping at the first failure.
    ///
    /// Returns the combined output of the batch with surrounding newlines
    /// trimmed.
    fn run_batch(&self, commands: &[String], opts: &RunOptions) -> Result<String>;

    fn run(&self, command: &str, opts: &RunOptions) -> Result<String> {
        self.run_batch(&[command.to_string()], opts)
    }
}

/// Runs commands through `/bin/sh`, or through a generated script inside a chroot.
#[derive(Clone, Debug, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    fn spawn(&self, mut cmd: Command, cmdline: &str, opts: &RunOptions) -> Result<String> {
        if let Some(env) = &opts.env {
            cmd.env_clear();
            if !env.contains_key("PATH") {
                cmd.env("PATH", DEFAULT_PATH);
            }
            cmd.envs(env);
        }
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }

        info!(
            command = cmdline,
            chroot = ?opts.chroot,
            cwd = ?opts.cwd,
            env = ?opts.env.as_ref().map(|e| e.keys().collect::<Vec<_>>()),
            "running command"
        );

        let output = cmd
            .output()
            .map_err(|e| BuildError::io(format!("failed to start '{cmdline}'"), e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let combined = combined.trim_matches(|c| c == '\r' || c == '\n').to_string();

        if !combined.is_empty() {
            debug!(command = cmdline, "output:\n{combined}");
        }

        if !output.status.success() {
            return Err(BuildError::StageFailure {
                command: cmdline.to_string(),
                status: output.status,
                output: combined,
            });
        }
        Ok(combined)
    }
}

impl CommandRunner for Executor {
    fn run_batch(&self, commands: &[String], opts: &RunOptions) -> Result<String> {
        if let Some(root) = &opts.chroot {
            return run_chroot_batch(self, root, commands, opts);
        }

        let mut outputs = Vec::with_capacity(commands.len());
        for line in commands {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            let out = self.spawn(cmd, line, opts)?;
            if !out.is_empty() {
                outputs.push(out);
            }
        }
        Ok(outputs.join("\n"))
    }
}

/// Runs `commands` inside `root` as one generated script.
///
/// The `chroot` invocation itself goes through `runner` on the host side, with
/// the environment and working directory from `opts`. When `opts` asks for
/// daemon suppression the guard is engaged first and released afterwards,
/// whether or not the batch succeeded.
pub fn run_chroot_batch(
    runner: &dyn CommandRunner,
    root: &Path,
    commands: &[String],
    opts: &RunOptions,
) -> Result<String> {
    if !root.is_dir() {
        return Err(BuildError::Precondition(format!(
            "chroot directory '{}' does not exist",
            root.display()
        )));
    }

    let suppression = if opts.suppress_daemons {
        Some(DaemonSuppression::engage(root, runner)?)
    } else {
        None
    };

    let result = write_chroot_script(root, commands).and_then(|script| {
        let inner = Path::new("/").join(
            script
                .strip_prefix(root)
                .map_err(|_| BuildError::Precondition("chroot script outside root".into()))?,
        );
        let host_opts = RunOptions {
            chroot: None,
            suppress_daemons: false,
            ..opts.clone()
        };
        runner.run(&format!("chroot {} {}", quote(root), inner.display()), &host_opts)
    });

    let released = suppression.map_or(Ok(()), DaemonSuppression::release);
    match (result, released) {
        (Ok(output), released) => released.map(|()| output),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release)) => {
            warn!(root = %root.display(), error = %release, "failed to re-enable daemons");
            Err(e)
        }
    }
}

/// Writes `commands` behind [`CHROOT_SCRIPT_PREAMBLE`] to a fresh script under
/// `<root>/root/` and returns its host-side path.
///
/// The script is left behind after it runs so a failed build can be
/// inspected.
pub fn write_chroot_script(root: &Path, commands: &[String]) -> Result<PathBuf> {
    let dir = root.join("root");
    fs::create_dir_all(&dir)
        .map_err(|e| BuildError::io(format!("creating {}", dir.display()), e))?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let path = dir.join(format!("chroot_{stamp}.sh"));

    let mut contents: Vec<&str> = CHROOT_SCRIPT_PREAMBLE.to_vec();
    contents.extend(commands.iter().map(String::as_str));
    let mut body = contents.join("\n");
    body.push('\n');

    fs::write(&path, body).map_err(|e| BuildError::io(format!("writing {}", path.display()), e))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
        .map_err(|e| BuildError::io(format!("chmod {}", path.display()), e))?;
    debug!(script = %path.display(), lines = commands.len(), "wrote chroot script");
    Ok(path)
}

/// Quotes a value for safe interpolation into a `/bin/sh` command line.
pub fn quote(value: impl AsRef<OsStr>) -> String {
    let s = value.as_ref().to_string_lossy();
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.into_owned();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
