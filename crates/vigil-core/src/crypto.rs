//! Signing seams
//!
//! The ledger signs and verifies through these traits so it never depends on
//! a concrete key manager.

use crate::errors::{Result, Sequence};
use crate::hash::Digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Stable identifier of a signing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl KeyId {
    /// Wrap a string identifier
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow as `&str`
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 64-byte Ed25519 signature, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntrySignature(pub [u8; 64]);

impl EntrySignature {
    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EntrySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntrySignature({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for EntrySignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntrySignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let mut out = [0u8; 64];
        hex::decode_to_slice(&raw, &mut out).map_err(serde::de::Error::custom)?;
        Ok(Self(out))
    }
}

/// Produces signatures over entry digests with the currently active key
pub trait Signer: Send + Sync {
    /// Identifier of the key that will sign
    fn key_id(&self) -> KeyId;

    /// Sign a digest
    fn sign_digest(&self, digest: &Digest) -> Result<EntrySignature>;
}

/// Verifies signatures against the key authoritative at a sequence
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(false)` for a well-formed but invalid or non-authoritative
    /// signature, `Err(Signature)` for unknown or revoked keys.
    fn verify_at(
        &self,
        digest: &Digest,
        signature: &EntrySignature,
        key_id: &KeyId,
        sequence: Sequence,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_hex_roundtrip() {
        let sig = EntrySignature([7u8; 64]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json.len(), 128 + 2);
        let back: EntrySignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_short_signature_rejected() {
        assert!(serde_json::from_str::<EntrySignature>("\"abcd\"").is_err());
    }

    #[test]
    fn test_key_id_is_transparent() {
        let id = KeyId::new("key-0011");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"key-0011\"");
    }
}
