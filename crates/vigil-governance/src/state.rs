//! Governance state derived by replaying the ledger
//!
//! Nothing here is stored: published versions, the active version at every
//! position, decision counts and key rotations are all recomputed from
//! ledger entries, so they cannot drift from the ledger.

use crate::policy::{
    ActivationMode, PolicyActivated, PolicyPublished, PolicyVersion, POLICY_ACTIVATED,
    POLICY_PUBLISHED,
};
use crate::receipt::{DecisionReceipt, Verdict, DECISION_RECORDED};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use vigil_core::{Digest, HashAlgorithmId, KeyId, Result, Sequence, VigilError};
use vigil_ledger::{LedgerEntry, MerkleAccumulator};
use vigil_signature::{RevocationRecord, RotationReceipt, REVOCATION_RECORD, ROTATION_RECORD};

/// A version as it was published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVersion {
    /// Content digest
    pub policy_hash: Digest,
    /// The version
    pub version: PolicyVersion,
    /// Sequence of the publication entry
    pub sequence: Sequence,
    /// Key that signed the publication entry
    pub publisher: KeyId,
}

/// One activation in ledger order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    /// Sequence of the activation entry
    pub sequence: Sequence,
    /// Version activated
    pub policy_hash: Digest,
    /// Label of that version
    pub label: String,
    /// Version it replaced
    pub previous: Option<Digest>,
    /// Forward or rollback
    pub mode: ActivationMode,
}

/// Key rotation seen during replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSummary {
    /// Sequence of the rotation entry
    pub sequence: Sequence,
    /// Outgoing key
    pub previous_key_id: KeyId,
    /// Incoming key
    pub new_key_id: KeyId,
    /// Stated reason
    pub reason: String,
}

/// Replayed governance state
#[derive(Debug, Clone, Default)]
pub struct GovernanceState {
    versions: BTreeMap<Digest, PublishedVersion>,
    activations: Vec<Activation>,
    decisions: BTreeMap<Verdict, u64>,
    rotations: Vec<RotationSummary>,
    revocations: Vec<KeyId>,
    anomalies: Vec<String>,
}

impl GovernanceState {
    /// Replay governance records from `entries`, in order
    ///
    /// Records that cannot be decoded are errors. Records that decode but
    /// contradict earlier state (an activation of an unknown version, a
    /// decision under a version that was not active) are kept as anomalies.
    pub fn replay(entries: &[LedgerEntry], algorithm: HashAlgorithmId) -> Result<Self> {
        let mut state = Self::default();
        for entry in entries {
            match entry.payload.record_type() {
                Some(POLICY_PUBLISHED) => state.apply_published(entry, algorithm)?,
                Some(POLICY_ACTIVATED) => state.apply_activated(entry)?,
                Some(DECISION_RECORDED) => state.apply_decision(entry)?,
                Some(ROTATION_RECORD) => {
                    let receipt: RotationReceipt = entry.payload.decode()?;
                    state.rotations.push(RotationSummary {
                        sequence: entry.sequence,
                        previous_key_id: receipt.body.previous_key_id,
                        new_key_id: receipt.body.new_key_id,
                        reason: receipt.body.reason,
                    });
                }
                Some(REVOCATION_RECORD) => {
                    let record: RevocationRecord = entry.payload.decode()?;
                    state.revocations.push(record.key_id);
                }
                _ => {}
            }
        }
        for anomaly in &state.anomalies {
            warn!(%anomaly, "governance replay anomaly");
        }
        Ok(state)
    }

    fn apply_published(&mut self, entry: &LedgerEntry, algorithm: HashAlgorithmId) -> Result<()> {
        let record: PolicyPublished = entry.payload.decode()?;
        let hash = record.version.hash(algorithm)?;
        if hash != record.policy_hash {
            self.anomalies.push(format!(
                "sequence {}: published policy hash {} does not match its content",
                entry.sequence,
                record.policy_hash.short()
            ));
            return Ok(());
        }
        if self.versions.contains_key(&hash) {
            self.anomalies.push(format!(
                "sequence {}: policy {} published twice",
                entry.sequence,
                hash.short()
            ));
            return Ok(());
        }
        self.versions.insert(
            hash,
            PublishedVersion {
                policy_hash: hash,
                version: record.version,
                sequence: entry.sequence,
                publisher: entry.key_id.clone(),
            },
        );
        Ok(())
    }

    fn apply_activated(&mut self, entry: &LedgerEntry) -> Result<()> {
        let record: PolicyActivated = entry.payload.decode()?;
        let Some(published) = self.versions.get(&record.policy_hash) else {
            self.anomalies.push(format!(
                "sequence {}: activation of unpublished policy {}",
                entry.sequence,
                record.policy_hash.short()
            ));
            return Ok(());
        };
        if record.previous != self.active_hash() {
            self.anomalies.push(format!(
                "sequence {}: activation records a stale predecessor",
                entry.sequence
            ));
        }
        self.activations.push(Activation {
            sequence: entry.sequence,
            policy_hash: record.policy_hash,
            label: published.version.label.clone(),
            previous: self.active_hash(),
            mode: record.mode,
        });
        Ok(())
    }

    fn apply_decision(&mut self, entry: &LedgerEntry) -> Result<()> {
        let receipt: DecisionReceipt = entry.payload.decode()?;
        if Some(receipt.body.policy_hash) != self.active_at(entry.sequence) {
            self.anomalies.push(format!(
                "sequence {}: decision {} used policy {} which was not active",
                entry.sequence,
                receipt.body.decision_id,
                receipt.body.policy_hash.short()
            ));
        }
        *self.decisions.entry(receipt.body.verdict).or_default() += 1;
        Ok(())
    }

    /// Currently active version hash
    pub fn active_hash(&self) -> Option<Digest> {
        self.activations.last().map(|a| a.policy_hash)
    }

    /// Currently active version
    pub fn active(&self) -> Option<&PublishedVersion> {
        self.active_hash().and_then(|h| self.versions.get(&h))
    }

    /// Version active at a ledger position
    ///
    /// An activation at sequence `s` takes effect from `s` itself.
    pub fn active_at(&self, sequence: Sequence) -> Option<Digest> {
        self.activations
            .iter()
            .take_while(|a| a.sequence <= sequence)
            .last()
            .map(|a| a.policy_hash)
    }

    /// Published version by hash
    pub fn version(&self, hash: &Digest) -> Option<&PublishedVersion> {
        self.versions.get(hash)
    }

    /// All published versions, keyed by hash
    pub fn versions(&self) -> &BTreeMap<Digest, PublishedVersion> {
        &self.versions
    }

    /// Activation history in ledger order
    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    /// Whether a version has ever been active
    pub fn was_active(&self, hash: &Digest) -> bool {
        self.activations.iter().any(|a| &a.policy_hash == hash)
    }

    /// Recorded decisions per verdict
    pub fn decisions(&self) -> &BTreeMap<Verdict, u64> {
        &self.decisions
    }

    /// Key rotations in ledger order
    pub fn rotations(&self) -> &[RotationSummary] {
        &self.rotations
    }

    /// Revoked keys in ledger order
    pub fn revocations(&self) -> &[KeyId] {
        &self.revocations
    }

    /// Contradictions met during replay
    pub fn anomalies(&self) -> &[String] {
        &self.anomalies
    }
}

/// Summary produced by a full governance replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceReplayReport {
    /// Entries replayed
    pub entry_count: u64,
    /// Merkle root recomputed from the replayed entries
    pub merkle_root: Digest,
    /// Whether the hash chain held throughout
    pub chain_intact: bool,
    /// Versions published
    pub published_versions: u64,
    /// Version active at the end of the ledger
    pub active_policy: Option<Digest>,
    /// Label of that version
    pub active_label: Option<String>,
    /// Activation history
    pub activations: Vec<Activation>,
    /// Decision counts by verdict
    pub decisions: BTreeMap<Verdict, u64>,
    /// Key rotations
    pub rotations: Vec<RotationSummary>,
    /// Revoked keys
    pub revocations: Vec<KeyId>,
    /// Contradictions met during replay
    pub anomalies: Vec<String>,
}

/// Replay the ledger from sequence zero and summarize its governance history
pub fn governance_replay(
    entries: &[LedgerEntry],
    algorithm: HashAlgorithmId,
) -> Result<GovernanceReplayReport> {
    let recomputed: Vec<Digest> = entries.iter().map(|e| e.recompute_digest(algorithm)).collect();
    let merkle = MerkleAccumulator::from_entry_digests(algorithm, &recomputed);
    let chain_intact = vigil_ledger::first_chain_fault(entries, algorithm).is_none();
    let state = GovernanceState::replay(entries, algorithm)?;
    let active = state.active();

    Ok(GovernanceReplayReport {
        entry_count: entries.len() as u64,
        merkle_root: merkle.root(),
        chain_intact,
        published_versions: state.versions.len() as u64,
        active_policy: active.map(|v| v.policy_hash),
        active_label: active.map(|v| v.version.label.clone()),
        activations: state.activations.clone(),
        decisions: state.decisions.clone(),
        rotations: state.rotations.clone(),
        revocations: state.revocations.clone(),
        anomalies: state.anomalies.clone(),
    })
}

/// Look up a version that must exist
pub(crate) fn require_version<'a>(
    state: &'a GovernanceState,
    hash: &Digest,
) -> Result<&'a PublishedVersion> {
    state.version(hash).ok_or_else(|| {
        VigilError::policy_version(format!("policy {} has not been published", hash.short()))
    })
}
