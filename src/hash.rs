//! Content hashing for tracked files.
//!
//! Two flavors share one value type: a plain SHA-1 over file bytes (the
//! `content_hash` of a tracked source file) and the version-control blob
//! form (`"blob <len>\0" + bytes`), which matches what the VCS computes
//! for a committed file and is used for non-source file dependencies.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// SHA-1 digest of tracked content, stored as raw bytes and rendered as
/// 40 lowercase hex characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "hex_bytes")] [u8; 20]);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(data: &[u8]) -> ContentHash {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_ref());
        ContentHash(bytes)
    }

    /// Hash bytes the way the VCS hashes a committed blob:
    /// `"blob <len>\0"` prefix followed by the content.
    pub fn blob(data: &[u8]) -> ContentHash {
        let mut hasher = Sha1::new();
        hasher.update(b"blob ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        ContentHash(bytes)
    }

    /// Hash a file's bytes by streaming, without loading it whole.
    pub fn of_reader(reader: &mut impl io::Read) -> io::Result<ContentHash> {
        let mut hasher = Sha1::new();
        io::copy(reader, &mut hasher)?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        Ok(ContentHash(bytes))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Parse 40 hex characters into a `ContentHash`.
impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(format!("invalid hash length {}", s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(ContentHash(h))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8; 20], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(de)?;
        let raw = hex::decode(&s).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("expected 20 hash bytes"))
    }
}
