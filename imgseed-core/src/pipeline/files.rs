//! Writing configuration files into the target root.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// How [`write_file`] treats an existing file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    append: bool,
    mode: Option<u32>,
    unique_only: bool,
}

impl WriteOptions {
    /// Replace the file's contents.
    pub fn overwrite() -> Self {
        Self::default()
    }

    /// Add to the end of the file.
    pub fn append() -> Self {
        Self {
            append: true,
            ..Self::default()
        }
    }

    /// Set permission bits after writing.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Skip lines the file already contains, so a rerun doesn't duplicate
    /// entries in e.g. `sources.list`.
    pub fn unique_only(mut self) -> Self {
        self.unique_only = true;
        self
    }
}

/// Writes `lines`, each newline terminated, to `path`.
pub fn write_file<S: AsRef<str>>(path: &Path, lines: &[S], opts: WriteOptions) -> Result<()> {
    let mut lines: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();

    if opts.unique_only {
        let existing = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let present: HashSet<&str> = existing.lines().collect();
        lines.retain(|line| !present.contains(line));
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(opts.append)
        .truncate(!opts.append)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    for line in &lines {
        writeln!(file, "{line}").with_context(|| format!("writing {}", path.display()))?;
    }

    if let Some(mode) = opts.mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {:o} {}", mode, path.display()))?;
    }
    debug!(path = %path.display(), lines = lines.len(), append = opts.append, "wrote file");
    Ok(())
}
