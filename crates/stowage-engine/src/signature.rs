//! Content-addressable identity of a work item.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncReadExt;

const HASH_BUFFER: usize = 64 * 1024;

/// A 32-byte BLAKE3 hash over the untransformed source bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        blake3::Hash::from_hex(s.trim())
            .ok()
            .map(|hash| ContentHash(*hash.as_bytes()))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity of a stored item: where it came from, what it contained and how it was encoded.
///
/// Two signatures are equal iff path, content hash and applied transforms all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Source path of the item.
    pub path: String,
    /// BLAKE3 hash of the untransformed source bytes.
    pub content_hash: ContentHash,
    /// Transform names in forward order; restore replays them in reverse.
    pub applied_transforms: Vec<String>,
}

impl Signature {
    /// Create a signature.
    pub fn new(
        path: impl Into<String>,
        content_hash: ContentHash,
        applied_transforms: Vec<String>,
    ) -> Self {
        Self {
            path: path.into(),
            content_hash,
            applied_transforms,
        }
    }

    /// Key under which backends store this item: BLAKE3 over all three fields.
    pub fn storage_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.path.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.content_hash.as_bytes());
        for name in &self.applied_transforms {
            hasher.update(&[0]);
            hasher.update(name.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Stream a whole file through BLAKE3.
pub async fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EngineError::io("open for hashing", path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| EngineError::io("read for hashing", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash(*hasher.finalize().as_bytes()))
}
