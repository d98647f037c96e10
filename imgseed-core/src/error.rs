//! Error types for the build pipeline.
//!
//! Errors are grouped by how an operator recovers from them:
//! - [`BuildError::StageFailure`]: an external command failed; inspect its output.
//! - [`BuildError::InvalidState`]: the status marker needs manual correction.
//! - [`BuildError::ResourceNotFound`] / [`BuildError::ResourceConflict`]: host
//!   devices or mounts are not in the expected shape.
//! - [`BuildError::Precondition`]: the request was rejected before any side effect.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result alias used across the core library.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// An external command exited nonzero.
    #[error("command failed ({status}): {command}")]
    StageFailure {
        command: String,
        status: ExitStatus,
        output: String,
    },

    /// The status marker is missing or corrupt while the image exists.
    #[error("invalid build state in {}: {reason}", path.display())]
    InvalidState { path: PathBuf, reason: String },

    /// A device node never appeared within the poll budget.
    #[error("{what} did not appear after {attempts} attempts")]
    ResourceNotFound { what: String, attempts: u32 },

    /// A mountpoint is occupied by something other than the expected source.
    #[error("{} is occupied by '{found}', expected '{expected}'", mountpoint.display())]
    ResourceConflict {
        mountpoint: PathBuf,
        expected: String,
        found: String,
    },

    /// The request was rejected before anything was touched.
    #[error("{0}")]
    Precondition(String),

    /// A stage action returned an error.
    #[error("stage {level} ({name}) failed")]
    Stage {
        level: u32,
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The operator asked to stop; the build halted between stages.
    #[error("interrupted after completing level {level}")]
    Interrupted { level: u32 },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    /// Finds the command failure at the bottom of an error chain, if any.
    ///
    /// Stage bodies wrap executor errors in `anyhow` context, so the failing
    /// command may sit several levels below the error the caller sees.
    pub fn find_command_failure<'a>(
        err: &'a (dyn std::error::Error + 'static),
    ) -> Option<(&'a str, &'a str)> {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(BuildError::StageFailure {
                command, output, ..
            }) = e.downcast_ref::<BuildError>()
            {
                return Some((command.as_str(), output.as_str()));
            }
            current = e.source();
        }
        None
    }
}
