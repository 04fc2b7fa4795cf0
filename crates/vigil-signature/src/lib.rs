#![forbid(unsafe_code)]
//! # Vigil Signature
//!
//! Ed25519 key lifecycle for the ledger. The [`KeyManager`] signs with the
//! active key and verifies historical entries against whichever key was
//! authoritative at their sequence, using the rotation lineage. Rotations are
//! cross-signed by both keys and appended to the ledger as ordinary entries.

pub mod keys;
pub mod manager;
pub mod rotation;

pub use keys::{
    derive_key_id, parse_public_key, sign_digest, verify_digest, KeyLineage, KeyRecord,
    KeySigner, KeyStatus,
};
pub use manager::KeyManager;
pub use rotation::{
    RevocationRecord, RotationBody, RotationOutcome, RotationReceipt, REVOCATION_RECORD,
    ROTATION_RECORD,
};
