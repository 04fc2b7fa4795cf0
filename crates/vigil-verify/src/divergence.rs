//! Divergence scan
//!
//! Recomputes every derived fact from the ledger entries of a snapshot and
//! diffs it against what was persisted: entry digests, the hash chain, entry
//! signatures, the index and the Merkle accumulator. Every divergent position
//! is reported; nothing is accepted by majority.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};
use vigil_core::{
    CancellationToken, Digest, KeyId, Result, Sequence, SignatureVerifier, Timestamp, VigilError,
};
use vigil_ledger::{
    records_from_ledger, IndexRecord, LedgerEntry, LedgerSnapshot, MerkleAccumulator, MerkleNode,
    UnreadableFrame,
};
use vigil_signature::{RotationReceipt, ROTATION_RECORD};

/// Entries between cancellation checkpoints
const CHECKPOINT_INTERVAL: usize = 1024;

/// Stored digest that does not match the entry's fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestMismatch {
    /// Entry position
    pub sequence: Sequence,
    /// Digest written in the frame
    pub stored: Digest,
    /// Digest recomputed from the entry's fields
    pub recomputed: Digest,
}

/// Link that does not point at its predecessor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Entry whose link is wrong
    pub sequence: Sequence,
    /// Recomputed digest of the predecessor
    pub expected: Digest,
    /// Previous digest recorded in the entry
    pub actual: Digest,
    /// Sequence number recorded in the entry, when it is not its position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_sequence: Option<Sequence>,
}

/// Entry whose signature does not verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFailure {
    /// Entry position
    pub sequence: Sequence,
    /// Claimed signer
    pub key_id: KeyId,
    /// Why verification failed
    pub message: String,
}

/// Entry timestamped before its predecessor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRegression {
    /// Entry position
    pub sequence: Sequence,
    /// Predecessor timestamp
    pub previous: Timestamp,
    /// Entry timestamp
    pub timestamp: Timestamp,
}

/// Index content compared with the index implied by the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDivergence {
    /// Ledger positions with no index record
    pub missing: Vec<Sequence>,
    /// Index records for positions the ledger does not hold
    pub unexpected: Vec<Sequence>,
    /// Index records whose digest or frame location is wrong
    pub mismatched: Vec<Sequence>,
    /// First frame whose length changed, moving every later frame
    ///
    /// Later records that are only displaced by that change are not listed
    /// as mismatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shifted_from: Option<Sequence>,
}

impl IndexDivergence {
    /// Whether the index matches the ledger
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Persisted Merkle state compared with a replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleDivergence {
    /// Root in the persisted state file, if readable
    pub persisted_root: Option<Digest>,
    /// Leaf count in the persisted state file, if readable
    pub persisted_leaves: Option<u64>,
    /// Root of the persisted node log
    pub node_log_root: Digest,
    /// Root replayed from recomputed entry digests
    pub replayed_root: Digest,
    /// Leaves replayed
    pub replayed_leaves: u64,
    /// First leaf at which the node log and the replay differ
    pub first_divergent_leaf: Option<Sequence>,
    /// First interior node of the node log that does not match its children
    pub inconsistent_node: Option<MerkleNode>,
    /// Problems met while loading the Merkle files
    pub problems: Vec<String>,
}

/// Most likely origin of a divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    /// Nothing diverges
    None,
    /// Ledger entries themselves are damaged
    LedgerCorruption,
    /// Only the index disagrees with the ledger
    IndexDrift,
    /// Only the Merkle state disagrees with the ledger
    MerkleDrift,
    /// Entries are intact but some signatures do not verify
    SignatureFailure,
    /// Divergence that fits none of the above
    Unknown,
}

/// Full divergence report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceReport {
    /// Entries scanned
    pub entries: u64,
    /// Entries whose stored digest is wrong
    pub digest_mismatches: Vec<DigestMismatch>,
    /// Broken links
    pub chain_breaks: Vec<ChainBreak>,
    /// Entries whose signature does not verify
    pub signature_failures: Vec<SignatureFailure>,
    /// Entries timestamped before their predecessor
    pub timestamp_regressions: Vec<TimestampRegression>,
    /// First frame that could not be decoded
    pub unreadable: Option<UnreadableFrame>,
    /// Index comparison
    pub index: IndexDivergence,
    /// Merkle comparison, present only when it diverges
    pub merkle: Option<MerkleDivergence>,
    /// Classification
    pub root_cause: RootCause,
}

impl DivergenceReport {
    /// Whether nothing diverges
    pub fn is_clean(&self) -> bool {
        self.root_cause == RootCause::None
    }

    /// Sequences whose own content, signature, index record or Merkle leaf
    /// diverges
    ///
    /// Chain breaks are listed separately: a tampered entry also breaks the
    /// link of its successor, which is intact itself.
    pub fn divergent_sequences(&self) -> Vec<Sequence> {
        let mut out = BTreeSet::new();
        out.extend(self.digest_mismatches.iter().map(|m| m.sequence));
        out.extend(self.signature_failures.iter().map(|f| f.sequence));
        out.extend(self.timestamp_regressions.iter().map(|t| t.sequence));
        out.extend(self.unreadable.iter().map(|u| u.sequence));
        out.extend(self.index.missing.iter().copied());
        out.extend(self.index.unexpected.iter().copied());
        out.extend(self.index.mismatched.iter().copied());
        out.extend(self.merkle.iter().filter_map(|m| m.first_divergent_leaf));
        out.into_iter().collect()
    }

    /// Most severe finding as an error
    pub fn to_error(&self) -> Option<VigilError> {
        if let Some(frame) = &self.unreadable {
            return Some(VigilError::chain_break(frame.sequence, Digest::ZERO, Digest::ZERO));
        }
        let first_mismatch = self.digest_mismatches.first();
        let first_break = self.chain_breaks.first();
        match (first_mismatch, first_break) {
            (Some(m), Some(b)) if b.sequence < m.sequence => {
                return Some(VigilError::chain_break(b.sequence, b.expected, b.actual))
            }
            (Some(m), _) => {
                return Some(VigilError::chain_break(m.sequence, m.recomputed, m.stored))
            }
            (None, Some(b)) => {
                return Some(VigilError::chain_break(b.sequence, b.expected, b.actual))
            }
            (None, None) => {}
        }
        if let Some(m) = &self.merkle {
            return Some(VigilError::merkle_divergence(
                m.persisted_root.unwrap_or(m.node_log_root),
                m.replayed_root,
                m.first_divergent_leaf,
            ));
        }
        if let Some(f) = self.signature_failures.first() {
            return Some(VigilError::signature(
                Some(f.key_id.as_str()),
                format!("sequence {}: {}", f.sequence, f.message),
            ));
        }
        if !self.index.is_clean() {
            return Some(VigilError::invalid(format!(
                "index diverges from ledger at {} positions",
                self.index.missing.len() + self.index.unexpected.len() + self.index.mismatched.len()
            )));
        }
        if let Some(t) = self.timestamp_regressions.first() {
            return Some(VigilError::invalid(format!(
                "sequence {} timestamp {} precedes {}",
                t.sequence, t.timestamp, t.previous
            )));
        }
        None
    }
}

/// Scan a snapshot for divergence
///
/// Signatures are checked against the stored digest, so a tampered payload
/// shows up as a digest mismatch rather than also as a signature failure.
pub fn divergence_scan(
    snapshot: &LedgerSnapshot,
    verifier: &dyn SignatureVerifier,
    cancel: &dyn CancellationToken,
) -> Result<DivergenceReport> {
    let algorithm = snapshot.algorithm;
    let entries: &[LedgerEntry] = &snapshot.entries;
    debug!(entries = entries.len(), algorithm = %algorithm, "divergence scan started");

    let mut digest_mismatches = Vec::new();
    let mut chain_breaks = Vec::new();
    let mut signature_failures = Vec::new();
    let mut timestamp_regressions = Vec::new();
    let mut recomputed = Vec::with_capacity(entries.len());

    let mut expected_previous = Digest::ZERO;
    let mut previous_timestamp: Option<Timestamp> = None;
    for (position, entry) in entries.iter().enumerate() {
        if position % CHECKPOINT_INTERVAL == 0 {
            cancel.checkpoint("divergence scan")?;
        }
        let sequence = position as Sequence;
        let digest = entry.recompute_digest(algorithm);

        if entry.sequence != sequence || entry.previous_digest != expected_previous {
            chain_breaks.push(ChainBreak {
                sequence,
                expected: expected_previous,
                actual: entry.previous_digest,
                recorded_sequence: (entry.sequence != sequence).then_some(entry.sequence),
            });
        }
        if digest != entry.digest {
            digest_mismatches.push(DigestMismatch {
                sequence,
                stored: entry.digest,
                recomputed: digest,
            });
        }
        if let Some(previous) = previous_timestamp {
            if entry.timestamp < previous {
                timestamp_regressions.push(TimestampRegression {
                    sequence,
                    previous,
                    timestamp: entry.timestamp,
                });
            }
        }
        if let Some(message) = signature_problem(entry, sequence, verifier, algorithm) {
            signature_failures.push(SignatureFailure {
                sequence,
                key_id: entry.key_id.clone(),
                message,
            });
        }

        expected_previous = digest;
        previous_timestamp = Some(entry.timestamp);
        recomputed.push(digest);
    }

    cancel.checkpoint("divergence scan: index")?;
    let index = compare_index(&snapshot.index, &records_from_ledger(entries, &snapshot.frames));

    cancel.checkpoint("divergence scan: merkle")?;
    let merkle = compare_merkle(snapshot, &recomputed);

    let mut report = DivergenceReport {
        entries: entries.len() as u64,
        digest_mismatches,
        chain_breaks,
        signature_failures,
        timestamp_regressions,
        unreadable: snapshot.unreadable.clone(),
        index,
        merkle,
        root_cause: RootCause::None,
    };
    report.root_cause = classify(&report);

    if report.is_clean() {
        info!(entries = report.entries, "divergence scan clean");
    } else {
        error!(
            entries = report.entries,
            root_cause = ?report.root_cause,
            divergent = ?report.divergent_sequences(),
            chain_breaks = report.chain_breaks.len(),
            "divergence detected"
        );
    }
    Ok(report)
}

fn signature_problem(
    entry: &LedgerEntry,
    sequence: Sequence,
    verifier: &dyn SignatureVerifier,
    algorithm: vigil_core::HashAlgorithmId,
) -> Option<String> {
    match verifier.verify_at(&entry.digest, &entry.signature, &entry.key_id, sequence) {
        Ok(true) => {}
        Ok(false) => {
            return Some(format!(
                "signature does not verify under key {} at this sequence",
                entry.key_id
            ))
        }
        Err(e) => return Some(e.to_string()),
    }
    if entry.payload.record_type() == Some(ROTATION_RECORD) {
        let checked = entry
            .payload
            .decode::<RotationReceipt>()
            .and_then(|receipt| receipt.verify(algorithm));
        if let Err(e) = checked {
            return Some(format!("rotation receipt: {e}"));
        }
    }
    None
}

fn compare_index(persisted: &[IndexRecord], expected: &[IndexRecord]) -> IndexDivergence {
    let mut by_sequence: BTreeMap<Sequence, &IndexRecord> = BTreeMap::new();
    let mut divergence = IndexDivergence::default();
    for record in persisted {
        if by_sequence.insert(record.sequence, record).is_some() {
            divergence.mismatched.push(record.sequence);
        }
    }
    // Bytes by which earlier resized frames moved the expected offsets
    let mut shift: i128 = 0;
    for record in expected {
        let Some(found) = by_sequence.remove(&record.sequence) else {
            divergence.missing.push(record.sequence);
            continue;
        };
        let displaced = shift != 0
            && found.digest == record.digest
            && found.length == record.length
            && i128::from(found.offset) + shift == i128::from(record.offset);
        if found != record && !displaced {
            divergence.mismatched.push(record.sequence);
        }
        if found.length != record.length {
            shift += i128::from(record.length) - i128::from(found.length);
            divergence.shifted_from.get_or_insert(record.sequence);
        }
    }
    divergence.unexpected.extend(by_sequence.into_keys());
    divergence.mismatched.sort_unstable();
    divergence.mismatched.dedup();
    divergence
}

fn compare_merkle(snapshot: &LedgerSnapshot, recomputed: &[Digest]) -> Option<MerkleDivergence> {
    let replayed = MerkleAccumulator::from_entry_digests(snapshot.algorithm, recomputed);
    let node_log: &MerkleAccumulator = &snapshot.merkle;
    let first_divergent_leaf = node_log.locate_divergence(&replayed);
    let inconsistent_node = node_log.first_inconsistent_node();
    let state_matches = snapshot.merkle_state.as_ref().is_some_and(|s| {
        s.root == replayed.root() && s.leaf_count == replayed.leaf_count()
    });

    if first_divergent_leaf.is_none()
        && inconsistent_node.is_none()
        && state_matches
        && snapshot.merkle_problems.is_empty()
    {
        return None;
    }
    // An empty ledger never writes a state file.
    if replayed.leaf_count() == 0
        && snapshot.merkle_state.is_none()
        && node_log.leaf_count() == 0
        && snapshot.merkle_problems.is_empty()
    {
        return None;
    }

    Some(MerkleDivergence {
        persisted_root: snapshot.merkle_state.as_ref().map(|s| s.root),
        persisted_leaves: snapshot.merkle_state.as_ref().map(|s| s.leaf_count),
        node_log_root: node_log.root(),
        replayed_root: replayed.root(),
        replayed_leaves: replayed.leaf_count(),
        first_divergent_leaf,
        inconsistent_node,
        problems: snapshot.merkle_problems.clone(),
    })
}

fn classify(report: &DivergenceReport) -> RootCause {
    let ledger_damaged = report.unreadable.is_some()
        || !report.digest_mismatches.is_empty()
        || !report.chain_breaks.is_empty();
    let index_drift = !report.index.is_clean();
    let merkle_drift = report.merkle.is_some();
    let signatures = !report.signature_failures.is_empty();

    if ledger_damaged {
        RootCause::LedgerCorruption
    } else if signatures {
        RootCause::SignatureFailure
    } else if index_drift && !merkle_drift {
        RootCause::IndexDrift
    } else if merkle_drift && !index_drift {
        RootCause::MerkleDrift
    } else if index_drift || merkle_drift || !report.timestamp_regressions.is_empty() {
        RootCause::Unknown
    } else {
        RootCause::None
    }
}
