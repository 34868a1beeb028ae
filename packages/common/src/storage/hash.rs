use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::StorageError;

/// SHA-256 digest identifying a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finish().0
    }

    /// Parse the 64-character hex form. Case-insensitive.
    pub fn from_hex(s: &str) -> Result<Self, StorageError> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(s, &mut digest).map_err(|e| {
            StorageError::InvalidHash(format!("'{s}' is not a SHA-256 hex digest: {e}"))
        })?;
        Ok(Self(digest))
    }

    /// Lowercase hex, as stored in the database and used for blob file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Strong HTTP entity tag: the quoted hex digest.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.to_hex())
    }

    /// Directory names of the two-level fanout, e.g. `("e3", "b0")`.
    pub fn fanout(&self) -> (String, String) {
        (hex::encode(&self.0[..1]), hex::encode(&self.0[1..2]))
    }
}

impl FromStr for ContentHash {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest that also counts the bytes it has seen.
#[derive(Default)]
pub struct ContentHasher {
    digest: Sha256,
    length: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.length += data.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finish(self) -> (ContentHash, u64) {
        (ContentHash(self.digest.finalize().into()), self.length)
    }
}
