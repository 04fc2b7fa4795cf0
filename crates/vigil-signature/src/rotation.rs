//! Rotation and revocation records
//!
//! Both are ordinary ledger payloads, tagged by `record_type`, so the key
//! lineage can be replayed from the ledger alone.

use crate::keys::{derive_key_id, parse_public_key, verify_digest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use vigil_core::{
    codec, domain, Digest, EntrySignature, HashAlgorithmId, KeyId, Result, Sequence, Timestamp,
    VigilError,
};

/// `record_type` of a rotation receipt
pub const ROTATION_RECORD: &str = "vigil.key.rotated";

/// `record_type` of a revocation
pub const REVOCATION_RECORD: &str = "vigil.key.revoked";

/// Statement both keys sign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationBody {
    /// Outgoing key
    pub previous_key_id: KeyId,
    /// Outgoing public key, hex
    pub previous_public_key: String,
    /// Incoming key
    pub new_key_id: KeyId,
    /// Incoming public key, hex
    pub new_public_key: String,
    /// Operator-supplied reason
    pub reason: String,
    /// When rotation was requested
    pub requested_at: Timestamp,
    /// Approvers on the governance token
    pub approvals: BTreeSet<String>,
    /// Nonce of the consumed token
    pub token_nonce: String,
}

impl RotationBody {
    /// Digest both keys sign
    pub fn digest(&self, algorithm: HashAlgorithmId) -> Result<Digest> {
        codec::canonical_digest(algorithm, domain::ROTATION, self)
    }
}

/// Cross-signed rotation statement, appended as a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReceipt {
    /// Always [`ROTATION_RECORD`]
    pub record_type: String,
    /// Signed statement
    pub body: RotationBody,
    /// Digest of `body`
    pub body_digest: Digest,
    /// Signature by the outgoing key
    pub signed_by_previous: EntrySignature,
    /// Signature by the incoming key
    pub signed_by_new: EntrySignature,
}

impl RotationReceipt {
    /// Check both signatures and that the key ids match their public keys
    pub fn verify(&self, algorithm: HashAlgorithmId) -> Result<()> {
        if self.record_type != ROTATION_RECORD {
            return Err(VigilError::invalid(format!(
                "record type '{}' is not a rotation receipt",
                self.record_type
            )));
        }
        let digest = self.body.digest(algorithm)?;
        if digest != self.body_digest {
            return Err(VigilError::signature(
                Some(self.body.new_key_id.as_str()),
                "rotation body digest does not match its contents",
            ));
        }
        let checks = [
            (
                &self.body.previous_key_id,
                &self.body.previous_public_key,
                &self.signed_by_previous,
            ),
            (
                &self.body.new_key_id,
                &self.body.new_public_key,
                &self.signed_by_new,
            ),
        ];
        for (key_id, public_key, signature) in checks {
            let key = parse_public_key(public_key, Some(key_id.as_str()))?;
            if &derive_key_id(algorithm, &key) != key_id {
                return Err(VigilError::signature(
                    Some(key_id.as_str()),
                    "key id does not match its public key",
                ));
            }
            if !verify_digest(&key, &digest, signature) {
                return Err(VigilError::signature(
                    Some(key_id.as_str()),
                    "rotation cross-signature does not verify",
                ));
            }
        }
        Ok(())
    }
}

/// Rotation as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOutcome {
    /// The appended receipt
    pub receipt: RotationReceipt,
    /// Sequence of the rotation entry (last sequence of the outgoing key)
    pub sequence: Sequence,
    /// First sequence signed by the incoming key
    pub effective_from: Sequence,
}

/// Revocation of a retired key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Always [`REVOCATION_RECORD`]
    pub record_type: String,
    /// Revoked key
    pub key_id: KeyId,
    /// Operator-supplied reason
    pub reason: String,
    /// When revocation was requested
    pub revoked_at: Timestamp,
    /// Approvers on the governance token
    pub approvals: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::sign_digest;
    use ed25519_dalek::SigningKey;
    use vigil_core::{Clock, ManualClock};

    fn receipt() -> RotationReceipt {
        let algo = HashAlgorithmId::Sha256;
        let old = SigningKey::from_bytes(&[1u8; 32]);
        let new = SigningKey::from_bytes(&[2u8; 32]);
        let body = RotationBody {
            previous_key_id: derive_key_id(algo, &old.verifying_key()),
            previous_public_key: hex::encode(old.verifying_key().as_bytes()),
            new_key_id: derive_key_id(algo, &new.verifying_key()),
            new_public_key: hex::encode(new.verifying_key().as_bytes()),
            reason: "scheduled".to_owned(),
            requested_at: ManualClock::at_epoch().now(),
            approvals: ["alice".to_owned(), "bob".to_owned()].into_iter().collect(),
            token_nonce: "n".to_owned(),
        };
        let digest = body.digest(algo).unwrap();
        RotationReceipt {
            record_type: ROTATION_RECORD.to_owned(),
            body,
            body_digest: digest,
            signed_by_previous: sign_digest(&old, &digest),
            signed_by_new: sign_digest(&new, &digest),
        }
    }

    #[test]
    fn test_cross_signed_receipt_verifies() {
        assert!(receipt().verify(HashAlgorithmId::Sha256).is_ok());
    }

    #[test]
    fn test_swapped_signatures_fail() {
        let mut r = receipt();
        std::mem::swap(&mut r.signed_by_previous, &mut r.signed_by_new);
        assert!(r.verify(HashAlgorithmId::Sha256).is_err());
    }

    #[test]
    fn test_edited_reason_fails() {
        let mut r = receipt();
        r.body.reason = "other".to_owned();
        let err = r.verify(HashAlgorithmId::Sha256).unwrap_err();
        assert_eq!(err.kind(), vigil_core::ErrorKind::Signature);
    }
}
