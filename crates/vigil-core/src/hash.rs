//! Pluggable hashing capability
//!
//! Hashing is pure and synchronous, so it sits behind a small trait rather
//! than anything heavier. The algorithm is chosen once at construction time
//! through [`HashAlgorithmId`] and recorded next to everything it produced,
//! so a verifier never has to guess which function a digest came from.
//!
//! - **SHA-256** is the default.
//! - **BLAKE3** is the alternate, selectable without touching call sites.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// 32-byte digest produced by every supported algorithm
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// All-zero digest, used as the previous digest of the genesis entry
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(value, &mut out)?;
        Ok(Self(out))
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Synchronous trait for cryptographic hashing
pub trait HashAlgorithm: Send + Sync + fmt::Debug {
    /// Identifier recorded alongside produced digests
    fn id(&self) -> HashAlgorithmId;

    /// Hash arbitrary bytes to a 32-byte digest
    fn hash(&self, data: &[u8]) -> Digest;

    /// Create an incremental hasher for multi-part hashing
    fn hasher(&self) -> Box<dyn Hasher>;
}

/// Trait for incremental hashing of multi-part data
pub trait Hasher: Send {
    /// Update the hasher with more data
    fn update(&mut self, data: &[u8]);

    /// Finalize the hasher and return the digest
    fn finalize(self: Box<Self>) -> Digest;
}

/// SHA-256 (FIPS 180-4)
#[derive(Debug, Clone, Copy)]
pub struct Sha256Algorithm;

impl HashAlgorithm for Sha256Algorithm {
    fn id(&self) -> HashAlgorithmId {
        HashAlgorithmId::Sha256
    }

    fn hash(&self, data: &[u8]) -> Digest {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }

    fn hasher(&self) -> Box<dyn Hasher> {
        Box::new(Sha256Hasher(<Sha256 as sha2::Digest>::new()))
    }
}

struct Sha256Hasher(Sha256);

impl Hasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        let result = sha2::Digest::finalize(self.0);
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Digest(output)
    }
}

/// BLAKE3
#[derive(Debug, Clone, Copy)]
pub struct Blake3Algorithm;

impl HashAlgorithm for Blake3Algorithm {
    fn id(&self) -> HashAlgorithmId {
        HashAlgorithmId::Blake3
    }

    fn hash(&self, data: &[u8]) -> Digest {
        Digest(*blake3::hash(data).as_bytes())
    }

    fn hasher(&self) -> Box<dyn Hasher> {
        Box::new(Blake3Hasher(blake3::Hasher::new()))
    }
}

struct Blake3Hasher(blake3::Hasher);

impl Hasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}

/// Algorithm selector, fixed at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithmId {
    /// SHA-256
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

impl HashAlgorithmId {
    /// Resolve the implementation
    pub fn algorithm(self) -> &'static dyn HashAlgorithm {
        match self {
            HashAlgorithmId::Sha256 => &Sha256Algorithm,
            HashAlgorithmId::Blake3 => &Blake3Algorithm,
        }
    }

    /// Hash bytes with this algorithm
    pub fn hash(self, data: &[u8]) -> Digest {
        self.algorithm().hash(data)
    }

    /// Hash under a domain tag, length-prefixing every part
    ///
    /// Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
    pub fn hash_tagged(self, tag: &[u8], parts: &[&[u8]]) -> Digest {
        let mut h = self.algorithm().hasher();
        h.update(tag);
        for part in parts {
            h.update(&(part.len() as u64).to_be_bytes());
            h.update(part);
        }
        h.finalize()
    }
}

impl fmt::Display for HashAlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithmId::Sha256 => f.write_str("sha256"),
            HashAlgorithmId::Blake3 => f.write_str("blake3"),
        }
    }
}

impl FromStr for HashAlgorithmId {
    type Err = crate::VigilError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithmId::Sha256),
            "blake3" => Ok(HashAlgorithmId::Blake3),
            other => Err(crate::VigilError::config(format!(
                "unsupported hash algorithm '{other}'"
            ))),
        }
    }
}

/// Domain separation tags
pub mod domain {
    /// Ledger entry digest
    pub const ENTRY: &[u8] = b"vigil:entry:v1\0";
    /// Merkle leaf node
    pub const MERKLE_LEAF: &[u8] = b"vigil:merkle:leaf:v1\0";
    /// Merkle interior node
    pub const MERKLE_NODE: &[u8] = b"vigil:merkle:node:v1\0";
    /// Root of an empty accumulator
    pub const MERKLE_EMPTY: &[u8] = b"vigil:merkle:empty:v1\0";
    /// Policy version identity
    pub const POLICY: &[u8] = b"vigil:policy:v1\0";
    /// Decision receipt body
    pub const RECEIPT: &[u8] = b"vigil:receipt:v1\0";
    /// Key rotation body
    pub const ROTATION: &[u8] = b"vigil:rotation:v1\0";
    /// Governance token fingerprint
    pub const TOKEN: &[u8] = b"vigil:token:v1\0";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA256("") = e3b0c442...b855
        let empty = HashAlgorithmId::Sha256.hash(b"");
        assert_eq!(
            empty.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_algorithms_differ() {
        let a = HashAlgorithmId::Sha256.hash(b"vigil");
        let b = HashAlgorithmId::Blake3.hash(b"vigil");
        assert_ne!(a, b);
    }

    #[test]
    fn test_incremental_hasher_equivalence() {
        for id in [HashAlgorithmId::Sha256, HashAlgorithmId::Blake3] {
            let mut h = id.algorithm().hasher();
            h.update(b"hello");
            h.update(b" world");
            assert_eq!(h.finalize(), id.hash(b"hello world"));
        }
    }

    #[test]
    fn test_tagged_parts_are_length_prefixed() {
        let id = HashAlgorithmId::Sha256;
        let left = id.hash_tagged(domain::ENTRY, &[b"ab", b"c"]);
        let right = id.hash_tagged(domain::ENTRY, &[b"a", b"bc"]);
        assert_ne!(left, right);
    }

    #[test]
    fn test_digest_hex_roundtrip_through_serde() {
        let digest = HashAlgorithmId::Blake3.hash(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(Digest::from_hex("zz").is_err());
    }

    #[test]
    fn test_parse_algorithm_names() {
        assert_eq!(
            "SHA256".parse::<HashAlgorithmId>().unwrap(),
            HashAlgorithmId::Sha256
        );
        assert!("md5".parse::<HashAlgorithmId>().is_err());
    }
}
