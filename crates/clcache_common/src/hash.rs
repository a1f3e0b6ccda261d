//! Content hashing for cache keys and include fingerprints.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Block size for streaming file reads.
const FILE_READ_BLOCK: usize = 64 * 1024;

/// A 256-bit SHA-256 content digest.
///
/// Two inputs with the same `Digest` are assumed identical. Used for object
/// keys, manifest hashes, and include-set fingerprints. Serialized as a
/// 64-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Computes the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Parses a 64-character hex string back into a digest.
    ///
    /// Returns `None` for anything that is not exactly 64 hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Returns the lowercase hex rendering of this digest.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// The first two hex characters, used as the shard directory name.
    pub fn shard(self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// The remaining hex characters after the shard prefix.
    pub fn tail(self) -> String {
        hex::encode(&self.0[1..])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 64-character hex string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Digest, E> {
                Digest::parse(v).ok_or_else(|| E::custom("invalid digest"))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// A streaming SHA-256 hasher.
///
/// Tuple and sequence hashing uses [`Hasher::update_component`], which
/// length-prefixes each component (`u64` big-endian length followed by the
/// bytes) so that concatenation ambiguities cannot produce collisions.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Creates a fresh hasher.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Feeds raw bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Feeds one length-prefixed component into the hash.
    pub fn update_component(&mut self, data: &[u8]) {
        self.inner.update((data.len() as u64).to_be_bytes());
        self.inner.update(data);
    }

    /// Consumes the hasher and returns the digest.
    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes a file's contents, reading in 64 KiB blocks.
pub fn hash_file(path: &Path) -> std::io::Result<Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; FILE_READ_BLOCK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Hashes a string.
pub fn hash_str(s: &str) -> Digest {
    Digest::from_bytes(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Digest::from_bytes(b"hello world");
        let b = Digest::from_bytes(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(Digest::from_bytes(b"hello"), Digest::from_bytes(b"world"));
    }

    #[test]
    fn display_is_64_hex_chars() {
        let s = Digest::from_bytes(b"test").to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shard_and_tail_recompose() {
        let d = Digest::from_bytes(b"shard me");
        let full = d.to_hex();
        assert_eq!(format!("{}{}", d.shard(), d.tail()), full);
        assert_eq!(d.shard().len(), 2);
    }

    #[test]
    fn parse_roundtrip() {
        let d = Digest::from_bytes(b"roundtrip");
        assert_eq!(Digest::parse(&d.to_hex()), Some(d));
        assert_eq!(Digest::parse("zz"), None);
        assert_eq!(Digest::parse(""), None);
    }

    #[test]
    fn serde_as_hex_string() {
        let d = Digest::from_bytes(b"serde");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn length_prefix_avoids_concat_ambiguity() {
        let mut a = Hasher::new();
        a.update_component(b"ab");
        a.update_component(b"c");

        let mut b = Hasher::new();
        b.update_component(b"a");
        b.update_component(b"bc");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.c");
        std::fs::write(&path, b"int main(void){return 0;}").unwrap();

        let from_file = hash_file(&path).unwrap();
        let from_bytes = Digest::from_bytes(b"int main(void){return 0;}");
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn file_hash_streams_large_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![0xabu8; 3 * FILE_READ_BLOCK + 17];
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), Digest::from_bytes(&data));
    }

    #[test]
    fn missing_file_errors() {
        assert!(hash_file(Path::new("/nonexistent/input.c")).is_err());
    }
}
