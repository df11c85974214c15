//! Key hashing
//!
//! Maps arbitrary cache keys to fixed-length identifiers used both as the
//! index primary key and as the blob file name. The digest is for storage
//! addressing and deduplication only; it is not a security boundary.
//!
//! Identifiers are 160-bit SHA-1 digests (20 dash-separated hex pairs).
//! Blob directories written with 128-bit MD5 names (16 pairs) use a
//! different naming and are not read back; such entries simply miss.

use std::fmt::Write;

use sha1::{Digest, Sha1};

/// Length of every identifier: 20 digest bytes as hex pairs joined by dashes
pub const IDENTIFIER_LEN: usize = 20 * 3 - 1;

/// Deterministic key -> identifier mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHasher;

impl KeyHasher {
    /// Hash a key into an uppercase, dash-separated hex identifier
    /// (e.g. `0A-4D-...`), stable across processes and platforms.
    pub fn hash(key: &str) -> String {
        let digest = Sha1::digest(key.as_bytes());
        let mut id = String::with_capacity(IDENTIFIER_LEN);
        for (i, byte) in digest.iter().enumerate() {
            if i > 0 {
                id.push('-');
            }
            // Writing to a String cannot fail
            let _ = write!(id, "{:02X}", byte);
        }
        id
    }
}
