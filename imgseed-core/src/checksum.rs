//! SHA-1 sidecar for the finished image.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::info;

use crate::error::{BuildError, Result};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Lowercase hex SHA-1 of the file at `path`, read in 1 MiB chunks.
pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).map_err(|e| BuildError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hashes `image` and writes the digest, newline terminated, to `sidecar`.
pub fn write_sidecar(image: &Path, sidecar: &Path) -> Result<String> {
    let digest = sha1_file(image)?;
    fs::write(sidecar, format!("{digest}\n"))
        .map_err(|e| BuildError::io(format!("writing {}", sidecar.display()), e))?;
    info!(image = %image.display(), sha1 = %digest, "checksum written");
    Ok(digest)
}
