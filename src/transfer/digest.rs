//! Content digests used to verify transfers.

use camino::Utf8Path;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const CHUNK: usize = 64 * 1024;

/// Size and lowercase hex SHA-256 of a payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fingerprint {
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256.
    pub sha256: String,
}

/// Hashes an in-memory payload.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprints a local file without loading it into memory.
///
/// # Errors
///
/// Returns the I/O error when the file cannot be opened or read.
pub async fn fingerprint_file(path: &Utf8Path) -> std::io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; CHUNK];
    let mut size = 0_u64;
    loop {
        let read = file.read(&mut buffer).await?;
        let Some(chunk) = buffer.get(..read) else {
            break;
        };
        if chunk.is_empty() {
            break;
        }
        hasher.update(chunk);
        size += chunk.len() as u64;
    }
    Ok(Fingerprint {
        size,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
