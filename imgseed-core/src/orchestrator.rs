//! Drives a [`BuildTarget`] through the stage registry.
//!
//! The orchestrator is the only writer of the status marker. It records a
//! level only after that stage's action returned successfully, so the marker
//! never runs ahead of the work actually done and a rerun resumes at the first
//! incomplete stage.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::{BuildError, Result};
use crate::resources::Resources;
use crate::stage::{Stage, StageRegistry};
use crate::status::StatusStore;
use crate::target::BuildTarget;

/// What the caller asked for.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildRequest {
    /// Stop after this level instead of the final one.
    pub finish_level: Option<u32>,
    /// Throw away the existing image and start from scratch.
    pub overwrite: bool,
    /// Plan only; run nothing, write nothing, delete nothing.
    pub dry_run: bool,
}

/// Outcome of a successful run (or plan).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub start_level: u32,
    pub finish_level: u32,
    /// `(level, name)` of every stage that ran, or would run for a dry run.
    pub stages: Vec<(u32, &'static str)>,
    pub dry_run: bool,
}

pub struct Orchestrator<'a> {
    registry: &'a StageRegistry,
    resources: &'a Resources,
    status: StatusStore,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(registry: &'a StageRegistry, resources: &'a Resources) -> Self {
        Self {
            registry,
            resources,
            status: StatusStore::new(registry.final_level()),
            interrupt: None,
        }
    }

    /// Stop between stages once `flag` becomes true.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// Runs every pending stage up to the requested finish level.
    ///
    /// `on_stage_start` and `on_stage_done` are called around each executed
    /// stage so a front-end can show progress; neither is called on dry runs.
    pub fn run<S, D>(
        &self,
        target: &BuildTarget,
        request: &BuildRequest,
        mut on_stage_start: S,
        mut on_stage_done: D,
    ) -> Result<BuildReport>
    where
        S: FnMut(&Stage),
        D: FnMut(&Stage, Duration),
    {
        let final_level = self.registry.final_level();
        let finish = request.finish_level.unwrap_or(final_level);
        if finish > final_level {
            return Err(BuildError::Precondition(format!(
                "requested level {finish} but the last stage is {final_level}"
            )));
        }

        let start = if request.overwrite {
            if request.dry_run {
                info!(image = %target.image().display(), "would remove existing image and status");
            } else {
                purge(self.resources, target)?;
            }
            0
        } else {
            let level = self.status.read(target)?;
            target.ensure_resumable()?;
            level
        };

        let mut report = BuildReport {
            start_level: start,
            finish_level: finish,
            stages: Vec::new(),
            dry_run: request.dry_run,
        };
        info!(image = %target.image_name(), start, finish, "starting build");

        let pending = self.registry.pending(start, finish);
        if pending.is_empty() {
            info!(level = start, "nothing to do");
            return Ok(report);
        }

        let mut completed = start;
        for stage in pending {
            if request.dry_run {
                info!(level = stage.level, name = stage.name, "would run: {}", stage.description);
                report.stages.push((stage.level, stage.name));
                continue;
            }
            if self.interrupted() {
                return Err(BuildError::Interrupted { level: completed });
            }

            info!(level = stage.level, name = stage.name, "running: {}", stage.description);
            on_stage_start(stage);
            let started = Instant::now();
            stage.run(target).map_err(|source| BuildError::Stage {
                level: stage.level,
                name: stage.name,
                source,
            })?;
            self.status.write(target, stage.level)?;
            completed = stage.level;
            report.stages.push((stage.level, stage.name));
            on_stage_done(stage, started.elapsed());
        }

        info!(image = %target.image_name(), level = completed, "build finished");
        Ok(report)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Releases every resource held for `target`, then deletes the image and its
/// status marker.
pub fn purge(resources: &Resources, target: &BuildTarget) -> Result<()> {
    resources.detach_all(target.image(), target.mount_root())?;
    remove_if_present(target.image())?;
    remove_if_present(&target.status_path())?;
    info!(image = %target.image().display(), "removed image and status marker");
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(format!("removing {}", path.display()), e)),
    }
}
