//! SHA-256 digests of image archives.

use std::io::Read;
use std::path::Path;

use capsule_common::error::{CapsuleError, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of everything `reader` yields.
///
/// # Errors
///
/// Returns the read failure.
pub fn hash_reader(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let _ = std::io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Computes the SHA-256 hash of a file.
///
/// # Errors
///
/// Returns `Io` if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let file = std::fs::File::open(path).map_err(|e| CapsuleError::io(path, e))?;
    hash_reader(std::io::BufReader::new(file)).map_err(|e| CapsuleError::io(path, e))
}
