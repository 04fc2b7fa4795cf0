//! Decision receipts and receipt diffs

use crate::policy::{ActionDescriptor, DecisionContext};
use crate::quorum::QuorumTally;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use vigil_core::{
    codec, domain, Digest, EntrySignature, HashAlgorithmId, KeyId, Result, Sequence,
    SignatureVerifier, Timestamp, VigilError,
};

/// `record_type` of a decision receipt
pub const DECISION_RECORDED: &str = "vigil.decision.recorded";

/// Result of a governance evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Action may proceed
    Approved,
    /// Action must not proceed
    Rejected,
    /// No decision yet
    Deferred,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
        })
    }
}

/// The signed part of a receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionBody {
    /// Unique decision id
    pub decision_id: Uuid,
    /// Action evaluated
    pub action: ActionDescriptor,
    /// Context it was evaluated in
    pub context: DecisionContext,
    /// Policy version used
    pub policy_hash: Digest,
    /// Label of that version
    pub policy_label: String,
    /// Rule that decided, `None` for the default effect
    pub rule_id: Option<String>,
    /// Vote count
    pub tally: QuorumTally,
    /// Outcome
    pub verdict: Verdict,
    /// Evaluation time
    pub evaluated_at: Timestamp,
}

impl DecisionBody {
    /// Digest the receipt signature covers
    pub fn digest(&self, algorithm: HashAlgorithmId) -> Result<Digest> {
        codec::canonical_digest(algorithm, domain::RECEIPT, self)
    }
}

/// Signed evaluation result, recorded as a ledger payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    /// Always [`DECISION_RECORDED`]
    pub record_type: String,
    /// Signed content
    pub body: DecisionBody,
    /// Digest of `body`
    pub body_digest: Digest,
    /// Key that signed
    pub key_id: KeyId,
    /// Signature over `body_digest`
    pub signature: EntrySignature,
}

impl DecisionReceipt {
    /// Check the digest and the signature against the key authoritative at
    /// the sequence the receipt was recorded at
    pub fn verify(
        &self,
        algorithm: HashAlgorithmId,
        verifier: &dyn SignatureVerifier,
        sequence: Sequence,
    ) -> Result<()> {
        if self.body.digest(algorithm)? != self.body_digest {
            return Err(VigilError::signature(
                Some(self.key_id.as_str()),
                format!("receipt {} does not match its digest", self.body.decision_id),
            ));
        }
        if !verifier.verify_at(&self.body_digest, &self.signature, &self.key_id, sequence)? {
            return Err(VigilError::signature(
                Some(self.key_id.as_str()),
                format!("receipt {} signature does not verify", self.body.decision_id),
            ));
        }
        Ok(())
    }
}

/// One differing field between two receipts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDifference {
    /// Dotted path, e.g. `body.tally.approvals`
    pub field: String,
    /// Value on the left, absent if missing
    pub left: Option<Value>,
    /// Value on the right, absent if missing
    pub right: Option<Value>,
}

/// Field-by-field difference of two JSON documents, paths in sorted order
///
/// Objects are compared key by key, recursively; any other value is compared
/// as a whole.
pub fn semantic_diff(left: &Value, right: &Value) -> Vec<FieldDifference> {
    let mut out = Vec::new();
    diff_into(String::new(), Some(left), Some(right), &mut out);
    out
}

fn diff_into(
    path: String,
    left: Option<&Value>,
    right: Option<&Value>,
    out: &mut Vec<FieldDifference>,
) {
    match (left, right) {
        (Some(Value::Object(l)), Some(Value::Object(r))) => {
            let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_into(child, l.get(key), r.get(key), out);
            }
        }
        (l, r) if l != r => out.push(FieldDifference {
            field: if path.is_empty() { "$".to_owned() } else { path },
            left: l.cloned(),
            right: r.cloned(),
        }),
        _ => {}
    }
}
