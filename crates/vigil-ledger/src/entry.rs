//! Ledger entries and their on-disk frames
//!
//! A frame is the canonical JSON encoding of a [`LedgerEntry`] followed by a
//! single `\n`. The payload is embedded as a JSON value; its canonical bytes
//! are what the entry digest commits to.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vigil_core::{
    codec, domain, Digest, EntrySignature, HashAlgorithmId, KeyId, Result, Sequence, Timestamp,
};

/// Payload held in canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPayload {
    value: serde_json::Value,
    bytes: Vec<u8>,
}

impl CanonicalPayload {
    /// Canonicalize any serializable value
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = codec::encode(value)?;
        let value = codec::decode(&bytes)?;
        Ok(Self { value, bytes })
    }

    /// Canonicalize a JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let bytes = codec::encode(&value)?;
        Ok(Self { value, bytes })
    }

    /// Canonical bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded value
    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Deserialize into a typed record
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.bytes)
    }

    /// `record_type` discriminator, if the payload is a typed record
    pub fn record_type(&self) -> Option<&str> {
        self.value.get("record_type").and_then(|v| v.as_str())
    }
}

impl Serialize for CanonicalPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CanonicalPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        CanonicalPayload::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// One immutable, signed, hash-chained record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Zero-based, gapless position
    pub sequence: Sequence,
    /// Canonical UTC append time
    pub timestamp: Timestamp,
    /// Canonically encoded payload
    pub payload: CanonicalPayload,
    /// Digest of the predecessor, zero for the genesis entry
    pub previous_digest: Digest,
    /// Digest of this entry
    pub digest: Digest,
    /// Key that signed `digest`
    pub key_id: KeyId,
    /// Signature over `digest`
    pub signature: EntrySignature,
}

/// H(previous ‖ payload ‖ timestamp ‖ signer), under the entry domain tag
pub fn compute_entry_digest(
    algorithm: HashAlgorithmId,
    previous: &Digest,
    payload: &[u8],
    timestamp: &Timestamp,
    key_id: &KeyId,
) -> Digest {
    algorithm.hash_tagged(
        domain::ENTRY,
        &[
            previous.as_bytes(),
            payload,
            timestamp.to_canonical().as_bytes(),
            key_id.as_str().as_bytes(),
        ],
    )
}

impl LedgerEntry {
    /// Digest implied by the stored fields
    pub fn recompute_digest(&self, algorithm: HashAlgorithmId) -> Digest {
        compute_entry_digest(
            algorithm,
            &self.previous_digest,
            self.payload.as_bytes(),
            &self.timestamp,
            &self.key_id,
        )
    }

    /// Frame bytes, newline terminated
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut frame = codec::encode(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Parse a frame, with or without its newline
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let body = frame.strip_suffix(b"\n").unwrap_or(frame);
        codec::decode(body)
    }
}

/// Byte range of a frame inside the ledger file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLocation {
    /// Offset of the first byte
    pub offset: u64,
    /// Length including the newline
    pub length: u64,
}
