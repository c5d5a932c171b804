use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::value::Value;

/// The identity of a cache entry.
///
/// Variables are not required to be comparable by instance; two structurally
/// equal values must address the same entry. The variables' canonical JSON
/// encoding (mapping keys sorted) is hashed with SHA-256, and key equality
/// and hashing go through the digest. The encoding itself is retained since
/// it is useful human-readable diagnostics output.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    canonical: Arc<str>,
    hash: [u8; 32],
}

impl CacheKey {
    /// Builds the key identifying `variables`.
    pub fn from_variables(variables: &Value) -> Self {
        let canonical =
            serde_json::to_string(variables).expect("plain data always serializes to JSON");
        let hash = Sha256::digest(&canonical);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        CacheKey {
            canonical: canonical.into(),
            hash,
        }
    }

    /// The canonical encoding this key was built from.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}
