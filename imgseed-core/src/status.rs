//! The durable "how far did we get" marker next to the image.

use std::fs;
use std::io::{self, Write};

use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{BuildError, Result};
use crate::target::BuildTarget;

/// Reads and writes `<image>.status.txt`.
#[derive(Clone, Copy, Debug)]
pub struct StatusStore {
    final_level: u32,
}

impl StatusStore {
    /// `final_level` is the highest valid marker, i.e. the number of stages.
    pub fn new(final_level: u32) -> Self {
        Self { final_level }
    }

    /// The last completed level. 0 when the image does not exist.
    pub fn read(&self, target: &BuildTarget) -> Result<u32> {
        if !target.image().exists() {
            return Ok(0);
        }
        let path = target.status_path();
        let invalid = |reason: String| BuildError::InvalidState {
            path: path.clone(),
            reason,
        };

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(invalid("image exists but the status marker is missing".into()));
            }
            Err(e) => return Err(BuildError::io(format!("reading {}", path.display()), e)),
        };

        let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(line) = lines.next() else {
            return Err(invalid("status marker is empty".into()));
        };
        if lines.next().is_some() {
            return Err(invalid("status marker has more than one line".into()));
        }
        let level: u32 = line
            .parse()
            .map_err(|_| invalid(format!("'{line}' is not a status level")))?;
        if level > self.final_level {
            return Err(invalid(format!(
                "level {level} is above the final level {}",
                self.final_level
            )));
        }
        Ok(level)
    }

    /// Atomically replaces the marker with `level`.
    pub fn write(&self, target: &BuildTarget, level: u32) -> Result<()> {
        if level > self.final_level {
            return Err(BuildError::Precondition(format!(
                "refusing to record level {level} above the final level {}",
                self.final_level
            )));
        }
        let path = target.status_path();
        let dir = target.image_dir();

        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| BuildError::io(format!("creating temp file in {}", dir.display()), e))?;
        writeln!(tmp, "{level}")
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| BuildError::io(format!("writing {}", tmp.path().display()), e))?;
        tmp.persist(&path)
            .map_err(|e| BuildError::io(format!("replacing {}", path.display()), e.error))?;

        info!(level, path = %path.display(), "status updated");
        Ok(())
    }
}
