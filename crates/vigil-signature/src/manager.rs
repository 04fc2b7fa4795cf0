//! Key manager: active key, rotation lineage, historical verification
//!
//! The lineage file (`lineage.json`) and one seed file per key live under the
//! key directory. The ledger is the record of truth for rotations; the
//! lineage file is a cache that [`KeyManager::reconcile`] brings forward.

use crate::keys::{
    derive_key_id, read_seed, sign_digest, verify_digest, write_seed, KeyLineage, KeyRecord,
    KeySigner, KeyStatus, LINEAGE_VERSION,
};
use crate::rotation::{
    RevocationRecord, RotationBody, RotationOutcome, RotationReceipt, REVOCATION_RECORD,
    ROTATION_RECORD,
};
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use rand_core::{CryptoRng, RngCore};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vigil_core::{
    Digest, EntrySignature, HashAlgorithmId, KeyId, Result, Sequence, SignatureVerifier, Signer,
    Timestamp, VigilError,
};
use vigil_guards::{GovernanceToken, TokenGuard, TokenScope};
use vigil_ledger::{LedgerEntry, LedgerStore};

const LINEAGE_FILE: &str = "lineage.json";

struct ActiveKey {
    lineage: KeyLineage,
    key_id: KeyId,
    key: SigningKey,
}

/// Owns the signing key lifecycle
pub struct KeyManager {
    dir: PathBuf,
    algorithm: HashAlgorithmId,
    min_rotation_interval_secs: u64,
    rng: Mutex<Box<dyn RngCore + Send>>,
    state: RwLock<ActiveKey>,
}

impl KeyManager {
    /// Open the key directory, creating a genesis key on first use
    pub fn open(
        dir: &Path,
        algorithm: HashAlgorithmId,
        min_rotation_interval_secs: u64,
        now: Timestamp,
    ) -> Result<Self> {
        Self::open_with_rng(
            dir,
            algorithm,
            min_rotation_interval_secs,
            now,
            rand::rngs::OsRng,
        )
    }

    /// Same as [`KeyManager::open`] with a caller-supplied generator
    pub fn open_with_rng<R>(
        dir: &Path,
        algorithm: HashAlgorithmId,
        min_rotation_interval_secs: u64,
        now: Timestamp,
        rng: R,
    ) -> Result<Self>
    where
        R: RngCore + CryptoRng + Send + 'static,
    {
        fs::create_dir_all(dir)?;
        let mut rng: Box<dyn RngCore + Send> = Box::new(rng);
        let lineage_path = dir.join(LINEAGE_FILE);

        let state = match KeyLineage::load(&lineage_path)? {
            Some(lineage) => {
                let record = lineage.active().ok_or_else(|| {
                    VigilError::signature(None, "key lineage has no active key")
                })?;
                let key_id = record.key_id.clone();
                let key = read_seed(dir, &key_id)?;
                if derive_key_id(algorithm, &key.verifying_key()) != key_id {
                    return Err(VigilError::signature(
                        Some(key_id.as_str()),
                        "key material does not match its lineage record",
                    ));
                }
                info!(key_id = %key_id, keys = lineage.keys.len(), "key lineage loaded");
                ActiveKey {
                    lineage,
                    key_id,
                    key,
                }
            }
            None => {
                let key = generate_key(&mut *rng);
                let key_id = derive_key_id(algorithm, &key.verifying_key());
                write_seed(dir, &key_id, &key)?;
                let lineage = KeyLineage::genesis(KeyRecord {
                    key_id: key_id.clone(),
                    public_key: hex::encode(key.verifying_key().as_bytes()),
                    status: KeyStatus::Active,
                    created_at: now,
                    activated_from: 0,
                    retired_after: None,
                    revoked_at: None,
                    reason: Some("genesis".to_owned()),
                });
                lineage.save(&lineage_path)?;
                info!(key_id = %key_id, "genesis signing key created");
                ActiveKey {
                    lineage,
                    key_id,
                    key,
                }
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            algorithm,
            min_rotation_interval_secs,
            rng: Mutex::new(rng),
            state: RwLock::new(state),
        })
    }

    /// Id of the key signing new entries
    pub fn active_key_id(&self) -> KeyId {
        self.state.read().key_id.clone()
    }

    /// Copy of the current lineage
    pub fn lineage(&self) -> KeyLineage {
        self.state.read().lineage.clone()
    }

    /// Sign a digest with the active key
    pub fn sign(&self, digest: &Digest) -> EntrySignature {
        sign_digest(&self.state.read().key, digest)
    }

    /// Verify against the key authoritative at `at_sequence`
    ///
    /// Unknown and revoked keys are errors; a valid key that was not
    /// authoritative at that sequence, or a bad signature, yields `false`.
    pub fn verify(
        &self,
        digest: &Digest,
        signature: &EntrySignature,
        key_id: &KeyId,
        at_sequence: Sequence,
    ) -> Result<bool> {
        let state = self.state.read();
        let record = state.lineage.get(key_id).ok_or_else(|| {
            VigilError::signature(Some(key_id.as_str()), "signing key is not in the lineage")
        })?;
        if record.status == KeyStatus::Revoked {
            return Err(VigilError::signature(
                Some(key_id.as_str()),
                "signing key has been revoked",
            ));
        }
        let authoritative = state
            .lineage
            .authoritative_at(at_sequence)
            .is_some_and(|k| &k.key_id == key_id);
        if !authoritative {
            return Ok(false);
        }
        Ok(verify_digest(&record.verifying_key()?, digest, signature))
    }

    /// Rotate to a freshly generated key
    ///
    /// Consumes `token` for [`TokenScope::RotateKey`] with at least
    /// `required_approvals` approvers. The cross-signed receipt is appended
    /// signed by the outgoing key, which stays authoritative through that
    /// entry; the new key signs from the next sequence on.
    pub fn rotate(
        &self,
        store: &LedgerStore,
        guard: &TokenGuard,
        token: &GovernanceToken,
        required_approvals: usize,
        reason: &str,
        now: Timestamp,
    ) -> Result<RotationOutcome> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(VigilError::invalid("a rotation reason is required"));
        }

        let (previous_id, previous_key, created_at) = {
            let state = self.state.read();
            let record = state.lineage.get(&state.key_id).ok_or_else(|| {
                VigilError::signature(Some(state.key_id.as_str()), "active key has no record")
            })?;
            (state.key_id.clone(), state.key.clone(), record.created_at)
        };
        let elapsed_ms = now.millis_since(&created_at);
        let min_ms = i64::try_from(self.min_rotation_interval_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        if elapsed_ms < min_ms {
            return Err(VigilError::invalid(format!(
                "key {previous_id} was activated {}s ago; rotation needs {}s",
                elapsed_ms / 1000,
                self.min_rotation_interval_secs
            )));
        }

        let grant = guard.consume(token, TokenScope::RotateKey, required_approvals, now)?;

        let new_key = {
            let mut rng = self.rng.lock();
            generate_key(&mut **rng)
        };
        let new_id = derive_key_id(self.algorithm, &new_key.verifying_key());
        write_seed(&self.dir, &new_id, &new_key)?;

        let body = RotationBody {
            previous_key_id: previous_id.clone(),
            previous_public_key: hex::encode(previous_key.verifying_key().as_bytes()),
            new_key_id: new_id.clone(),
            new_public_key: hex::encode(new_key.verifying_key().as_bytes()),
            reason: reason.to_owned(),
            requested_at: now,
            approvals: grant.approvals().clone(),
            token_nonce: grant.nonce().to_string(),
        };
        let body_digest = body.digest(self.algorithm)?;
        let receipt = RotationReceipt {
            record_type: ROTATION_RECORD.to_owned(),
            signed_by_previous: sign_digest(&previous_key, &body_digest),
            signed_by_new: sign_digest(&new_key, &body_digest),
            body,
            body_digest,
        };

        let outgoing = KeySigner::new(previous_id.clone(), previous_key);
        // Swap under the store's writer lock so no append signed by the
        // outgoing key can follow the rotation entry.
        let (entry, ()) = store.append_then(&receipt, &outgoing, grant, |entry| {
            let mut state = self.state.write();
            if state.key_id != previous_id {
                return Err(VigilError::invalid(format!(
                    "active key changed to {} during rotation",
                    state.key_id
                )));
            }
            apply_rotation(&mut state.lineage, &receipt, entry.sequence, now)?;
            state.key_id = new_id.clone();
            state.key = new_key;
            self.save(&state.lineage)
        })?;

        info!(
            previous = %previous_id,
            new = %new_id,
            sequence = entry.sequence,
            "signing key rotated"
        );
        Ok(RotationOutcome {
            receipt,
            sequence: entry.sequence,
            effective_from: entry.sequence + 1,
        })
    }

    /// Revoke a retired key
    ///
    /// The active key cannot be revoked; rotate away from it first.
    pub fn revoke(
        &self,
        store: &LedgerStore,
        guard: &TokenGuard,
        token: &GovernanceToken,
        required_approvals: usize,
        key_id: &KeyId,
        reason: &str,
        now: Timestamp,
    ) -> Result<RevocationRecord> {
        {
            let state = self.state.read();
            let record = state
                .lineage
                .get(key_id)
                .ok_or_else(|| VigilError::not_found(format!("no key {key_id} in the lineage")))?;
            match record.status {
                KeyStatus::Active => {
                    return Err(VigilError::invalid(format!(
                        "key {key_id} is active; rotate before revoking it"
                    )))
                }
                KeyStatus::Revoked => {
                    return Err(VigilError::invalid(format!("key {key_id} is already revoked")))
                }
                KeyStatus::Retired => {}
            }
        }

        let grant = guard.consume(token, TokenScope::Revoke, required_approvals, now)?;
        let record = RevocationRecord {
            record_type: REVOCATION_RECORD.to_owned(),
            key_id: key_id.clone(),
            reason: reason.trim().to_owned(),
            revoked_at: now,
            approvals: grant.approvals().clone(),
        };
        let entry = store.append(&record, self, grant)?;

        let mut state = self.state.write();
        apply_revocation(&mut state.lineage, &record);
        self.save(&state.lineage)?;
        warn!(key_id = %key_id, sequence = entry.sequence, "signing key revoked");
        Ok(record)
    }

    /// Apply rotation and revocation entries the lineage file is missing
    ///
    /// Returns how many records were applied.
    pub fn reconcile(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let mut state = self.state.write();
        let mut applied = 0;
        for entry in entries {
            match entry.payload.record_type() {
                Some(ROTATION_RECORD) => {
                    let receipt: RotationReceipt = entry.payload.decode()?;
                    if state.lineage.get(&receipt.body.new_key_id).is_some() {
                        continue;
                    }
                    receipt.verify(self.algorithm)?;
                    if receipt.body.previous_key_id != state.key_id {
                        return Err(VigilError::signature(
                            Some(receipt.body.previous_key_id.as_str()),
                            format!(
                                "rotation at sequence {} does not start from the active key",
                                entry.sequence
                            ),
                        ));
                    }
                    let key = read_seed(&self.dir, &receipt.body.new_key_id)?;
                    apply_rotation(
                        &mut state.lineage,
                        &receipt,
                        entry.sequence,
                        receipt.body.requested_at,
                    )?;
                    state.key_id = receipt.body.new_key_id.clone();
                    state.key = key;
                    applied += 1;
                }
                Some(REVOCATION_RECORD) => {
                    let record: RevocationRecord = entry.payload.decode()?;
                    let pending = state
                        .lineage
                        .get(&record.key_id)
                        .is_some_and(|k| k.status != KeyStatus::Revoked);
                    if pending {
                        apply_revocation(&mut state.lineage, &record);
                        applied += 1;
                    }
                }
                _ => {}
            }
        }
        if applied > 0 {
            self.save(&state.lineage)?;
            info!(applied, active = %state.key_id, "key lineage reconciled with ledger");
        }
        Ok(applied)
    }

    /// Digest algorithm used for key ids and rotation bodies
    pub fn algorithm(&self) -> HashAlgorithmId {
        self.algorithm
    }

    fn save(&self, lineage: &KeyLineage) -> Result<()> {
        lineage.save(&self.dir.join(LINEAGE_FILE))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("dir", &self.dir)
            .field("active", &self.state.read().key_id)
            .finish_non_exhaustive()
    }
}

impl Signer for KeyManager {
    fn key_id(&self) -> KeyId {
        self.active_key_id()
    }

    fn sign_digest(&self, digest: &Digest) -> Result<EntrySignature> {
        Ok(self.sign(digest))
    }
}

impl SignatureVerifier for KeyManager {
    fn verify_at(
        &self,
        digest: &Digest,
        signature: &EntrySignature,
        key_id: &KeyId,
        sequence: Sequence,
    ) -> Result<bool> {
        self.verify(digest, signature, key_id, sequence)
    }
}

fn generate_key(rng: &mut dyn RngCore) -> SigningKey {
    let mut seed = [0u8; 32];
    rng.fill_bytes(&mut seed);
    SigningKey::from_bytes(&seed)
}

fn apply_rotation(
    lineage: &mut KeyLineage,
    receipt: &RotationReceipt,
    sequence: Sequence,
    at: Timestamp,
) -> Result<()> {
    let body = &receipt.body;
    let previous = lineage.get_mut(&body.previous_key_id).ok_or_else(|| {
        VigilError::signature(
            Some(body.previous_key_id.as_str()),
            "outgoing key is not in the lineage",
        )
    })?;
    previous.status = KeyStatus::Retired;
    previous.retired_after = Some(sequence);
    lineage.version = LINEAGE_VERSION;
    lineage.keys.push(KeyRecord {
        key_id: body.new_key_id.clone(),
        public_key: body.new_public_key.clone(),
        status: KeyStatus::Active,
        created_at: at,
        activated_from: sequence + 1,
        retired_after: None,
        revoked_at: None,
        reason: Some(body.reason.clone()),
    });
    Ok(())
}

fn apply_revocation(lineage: &mut KeyLineage, record: &RevocationRecord) {
    if let Some(key) = lineage.get_mut(&record.key_id) {
        key.status = KeyStatus::Revoked;
        key.revoked_at = Some(record.revoked_at);
    }
}
