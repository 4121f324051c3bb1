//! Content checksums for migrations, seeds and schema objects

use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Hexadecimal SHA-256 of `content`
pub fn checksum(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Hexadecimal SHA-256 of a file's bytes
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    fs::read(path).map(checksum)
}

/// Validate checksum against stored value
///
/// Comparison is exact; checksums are never normalized or prefix-matched.
pub fn checksums_match(stored_checksum: &str, current_checksum: &str) -> bool {
    stored_checksum == current_checksum
}
