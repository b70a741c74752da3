//! Content hashing for duplicate suppression.
//!
//! Webhook providers redeliver the same logical event with cosmetic differences
//! (timestamps, field ordering, extra fields). A [`DedupHash`] is computed over the
//! semantically significant fields only, so those redeliveries collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable hex-encoded SHA-256 over an event's significant fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupHash(String);

impl DedupHash {
    /// Hash an ordered list of fields.
    ///
    /// Each field is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for field in fields {
            let bytes = field.as_ref().as_bytes();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hash (e.g. loaded from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Implemented by payload types that know which of their fields identify the
/// logical event.
pub trait Deduplicable {
    /// Ordered significant fields (event kind first, by convention).
    fn dedup_fields(&self) -> Vec<String>;

    fn dedup_hash(&self) -> DedupHash {
        DedupHash::from_fields(self.dedup_fields())
    }
}
