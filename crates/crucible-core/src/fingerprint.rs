//! Content fingerprints — the deduplication key.
//!
//! Two requests with the same script and the same input bytes collapse to
//! the same fingerprint no matter who submitted them or what id they carry.
//!
//!   fingerprint = BLAKE3(script || 0x00 || input)
//!
//! The 0x00 separator keeps (script="ab", input="c") distinct from
//! (script="a", input="bc"); script keys are resolved as file names and
//! never contain NUL.

use std::fmt;

/// Deduplication key for a (script, input) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a request's dedup-relevant fields.
    pub fn of(script: &str, input: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(script.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(input);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, used as the cache key string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
