//! Key records, lineage and key material on disk

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vigil_core::persist::{read_optional, write_atomic_private};
use vigil_core::{
    Digest, EntrySignature, HashAlgorithmId, KeyId, Result, Sequence, Signer, Timestamp,
    VigilError,
};

/// Lifecycle of a signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Signs new entries
    Active,
    /// Superseded by rotation; still verifies its historical range
    Retired,
    /// Compromised or withdrawn; signatures by it are refused
    Revoked,
}

/// One key in the rotation lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Derived identifier
    pub key_id: KeyId,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Lifecycle status
    pub status: KeyStatus,
    /// When the key became active
    pub created_at: Timestamp,
    /// First sequence this key is authoritative for
    pub activated_from: Sequence,
    /// Last sequence this key is authoritative for (the rotation entry)
    pub retired_after: Option<Sequence>,
    /// When the key was revoked
    pub revoked_at: Option<Timestamp>,
    /// Why this key replaced its predecessor
    pub reason: Option<String>,
}

impl KeyRecord {
    /// Whether the key was authoritative at `sequence`
    pub fn covers(&self, sequence: Sequence) -> bool {
        sequence >= self.activated_from && self.retired_after.map_or(true, |last| sequence <= last)
    }

    /// Parsed public key
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        parse_public_key(&self.public_key, Some(self.key_id.as_str()))
    }
}

/// Ordered history of signing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLineage {
    /// Format version
    pub version: u32,
    /// Keys in activation order
    pub keys: Vec<KeyRecord>,
}

/// Lineage file format version
pub const LINEAGE_VERSION: u32 = 1;

impl KeyLineage {
    /// Lineage holding only a genesis key
    pub fn genesis(record: KeyRecord) -> Self {
        Self {
            version: LINEAGE_VERSION,
            keys: vec![record],
        }
    }

    /// Record for a key id
    pub fn get(&self, key_id: &KeyId) -> Option<&KeyRecord> {
        self.keys.iter().find(|k| &k.key_id == key_id)
    }

    pub(crate) fn get_mut(&mut self, key_id: &KeyId) -> Option<&mut KeyRecord> {
        self.keys.iter_mut().find(|k| &k.key_id == key_id)
    }

    /// The active key
    pub fn active(&self) -> Option<&KeyRecord> {
        self.keys.iter().rev().find(|k| k.status == KeyStatus::Active)
    }

    /// Key that was authoritative at a historical sequence
    pub fn authoritative_at(&self, sequence: Sequence) -> Option<&KeyRecord> {
        self.keys.iter().find(|k| k.covers(sequence))
    }

    /// Load from disk
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let Some(bytes) = read_optional(path)? else {
            return Ok(None);
        };
        let lineage: KeyLineage = vigil_core::decode(&bytes)?;
        if lineage.version != LINEAGE_VERSION {
            return Err(VigilError::storage(format!(
                "key lineage version {} is not supported",
                lineage.version
            )));
        }
        Ok(Some(lineage))
    }

    /// Persist atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic_private(path, &vigil_core::encode(self)?)
    }
}

/// `key-` followed by the first 16 hex characters of H(public key)
pub fn derive_key_id(algorithm: HashAlgorithmId, public_key: &VerifyingKey) -> KeyId {
    let digest = algorithm.hash(public_key.as_bytes());
    KeyId::new(format!("key-{}", &digest.to_hex()[..16]))
}

/// Parse a hex public key
pub fn parse_public_key(hex_key: &str, key_id: Option<&str>) -> Result<VerifyingKey> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut bytes)
        .map_err(|e| VigilError::signature(key_id, format!("public key is not hex: {e}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| VigilError::signature(key_id, format!("invalid public key: {e}")))
}

/// Verify an Ed25519 signature over a digest
pub fn verify_digest(key: &VerifyingKey, digest: &Digest, signature: &EntrySignature) -> bool {
    let signature = Signature::from_bytes(signature.as_bytes());
    key.verify_strict(digest.as_bytes(), &signature).is_ok()
}

/// Sign a digest
pub fn sign_digest(key: &SigningKey, digest: &Digest) -> EntrySignature {
    EntrySignature(key.sign(digest.as_bytes()).to_bytes())
}

pub(crate) fn seed_path(dir: &Path, key_id: &KeyId) -> std::path::PathBuf {
    dir.join(format!("{key_id}.seed"))
}

pub(crate) fn write_seed(dir: &Path, key_id: &KeyId, key: &SigningKey) -> Result<()> {
    let mut text = hex::encode(key.to_bytes());
    text.push('\n');
    write_atomic_private(&seed_path(dir, key_id), text.as_bytes())
}

pub(crate) fn read_seed(dir: &Path, key_id: &KeyId) -> Result<SigningKey> {
    let path = seed_path(dir, key_id);
    let bytes = read_optional(&path)?.ok_or_else(|| {
        VigilError::signature(Some(key_id.as_str()), "key material is missing")
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let mut seed = [0u8; 32];
    hex::decode_to_slice(text.trim(), &mut seed).map_err(|e| {
        VigilError::signature(Some(key_id.as_str()), format!("key material unreadable: {e}"))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// A fixed key acting as a [`Signer`]
pub struct KeySigner {
    key_id: KeyId,
    key: SigningKey,
}

impl KeySigner {
    /// Wrap a key and its id
    pub fn new(key_id: KeyId, key: SigningKey) -> Self {
        Self { key_id, key }
    }
}

impl Signer for KeySigner {
    fn key_id(&self) -> KeyId {
        self.key_id.clone()
    }

    fn sign_digest(&self, digest: &Digest) -> Result<EntrySignature> {
        Ok(sign_digest(&self.key, digest))
    }
}
