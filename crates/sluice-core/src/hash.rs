use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte content fingerprint computed as BLAKE2b-256 over the whole
/// file, fed chunk-by-chunk in index order.
///
/// Used as the deduplication key on the remote store; hex-encoded on the
/// wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hex-encode the full fingerprint for wire use.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a ContentHash from a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(ContentHash(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Incremental fingerprint accumulator.
///
/// Order-sensitive: chunks must be appended strictly in index order.
pub struct ContentHasher {
    inner: Blake2b256,
}

impl ContentHasher {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Blake2b256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.inner, data);
    }

    pub fn finalize(self) -> ContentHash {
        let out: [u8; 32] = self.inner.finalize().into();
        ContentHash(out)
    }
}

/// Hash a full in-memory buffer in one call.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}
