//! Script integrity checksums.
//!
//! A migration's checksum is the SHA-256 of its up script, computed once at
//! registration and never mutated. The verifier recomputes it to detect
//! out-of-band edits; a mismatch never blocks execution on its own.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a script body.
pub fn calculate_checksum(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// True when `script` still hashes to `stored_checksum`.
pub fn verify_checksum(stored_checksum: &str, script: &str) -> bool {
    calculate_checksum(script) == stored_checksum
}
