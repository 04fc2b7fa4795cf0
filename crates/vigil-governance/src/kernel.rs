//! Governance kernel
//!
//! # Decision lifecycle
//!
//! ```text
//! PendingDecision --evaluate--> EvaluatedDecision --record--> RecordedDecision
//! ```
//!
//! Each stage is its own type, so a receipt cannot be treated as final before
//! the ledger accepted it, and a recorded decision cannot be re-evaluated.
//! The active policy is always taken from a fresh replay of the ledger.

use crate::policy::{
    ActionDescriptor, ActivationMode, DecisionContext, PolicyActivated, PolicyPublished,
    PolicyVersion, RuleEffect, POLICY_ACTIVATED, POLICY_PUBLISHED,
};
use crate::quorum::{tally, QuorumOutcome, QuorumTally, Vote};
use crate::receipt::{DecisionBody, DecisionReceipt, Verdict, DECISION_RECORDED};
use crate::state::{require_version, GovernanceState, PublishedVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_core::{Clock, Digest, Result, Sequence, VigilError};
use vigil_guards::{ConsumedGrant, GovernanceToken, TokenGuard, TokenScope};
use vigil_ledger::LedgerStore;
use vigil_signature::{KeyManager, KeyStatus};

/// A decision request that has not been evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDecision {
    action: ActionDescriptor,
    context: DecisionContext,
    votes: Vec<Vote>,
}

impl PendingDecision {
    /// Request a decision on `action`
    pub fn new(action: ActionDescriptor, context: DecisionContext) -> Self {
        Self {
            action,
            context,
            votes: Vec::new(),
        }
    }

    /// Attach votes for quorum simulation
    pub fn with_votes(mut self, votes: impl IntoIterator<Item = Vote>) -> Self {
        self.votes.extend(votes);
        self
    }

    /// Apply `policy` and sign the resulting receipt
    pub fn evaluate(
        self,
        policy: &PublishedVersion,
        keys: &KeyManager,
        clock: &dyn Clock,
    ) -> Result<EvaluatedDecision> {
        let version = &policy.version;
        let selected = version.select(&self.action, &self.context);
        let (tally, verdict) = match selected.effect {
            RuleEffect::Approve => (QuorumTally::not_required(), Verdict::Approved),
            RuleEffect::Reject => (QuorumTally::not_required(), Verdict::Rejected),
            RuleEffect::Defer => (QuorumTally::not_required(), Verdict::Deferred),
            RuleEffect::RequireQuorum { threshold } => {
                let threshold = threshold.unwrap_or(version.quorum.threshold);
                let counted = tally(&version.quorum, threshold, &self.votes);
                let verdict = match counted.outcome {
                    QuorumOutcome::Met => Verdict::Approved,
                    QuorumOutcome::Failed => Verdict::Rejected,
                    QuorumOutcome::Pending => Verdict::Deferred,
                };
                (counted, verdict)
            }
        };

        let body = DecisionBody {
            decision_id: Uuid::new_v4(),
            action: self.action,
            context: self.context,
            policy_hash: policy.policy_hash,
            policy_label: version.label.clone(),
            rule_id: selected.rule.map(|r| r.id.clone()),
            tally,
            verdict,
            evaluated_at: clock.now(),
        };
        let body_digest = body.digest(keys.algorithm())?;
        let receipt = DecisionReceipt {
            record_type: DECISION_RECORDED.to_owned(),
            key_id: keys.active_key_id(),
            signature: keys.sign(&body_digest),
            body,
            body_digest,
        };
        Ok(EvaluatedDecision { receipt })
    }
}

/// Evaluated and signed, not yet in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedDecision {
    receipt: DecisionReceipt,
}

impl EvaluatedDecision {
    /// The signed receipt
    pub fn receipt(&self) -> &DecisionReceipt {
        &self.receipt
    }

    /// Verdict reached
    pub fn verdict(&self) -> Verdict {
        self.receipt.body.verdict
    }

    /// Append the receipt to the ledger
    ///
    /// On failure the decision is handed back unchanged with the error.
    pub fn record(
        self,
        store: &LedgerStore,
        keys: &KeyManager,
        grant: ConsumedGrant,
    ) -> std::result::Result<RecordedDecision, (Self, VigilError)> {
        match store.append(&self.receipt, keys, grant) {
            Ok(entry) => {
                info!(
                    decision_id = %self.receipt.body.decision_id,
                    verdict = %self.receipt.body.verdict,
                    sequence = entry.sequence,
                    "decision recorded"
                );
                Ok(RecordedDecision {
                    receipt: self.receipt,
                    sequence: entry.sequence,
                    entry_digest: entry.digest,
                })
            }
            Err(e) => {
                warn!(
                    decision_id = %self.receipt.body.decision_id,
                    error = %e,
                    "decision receipt not recorded"
                );
                Err((self, e))
            }
        }
    }
}

/// Final: the receipt is a committed ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDecision {
    /// The receipt
    pub receipt: DecisionReceipt,
    /// Ledger sequence of the receipt
    pub sequence: Sequence,
    /// Digest of that entry
    pub entry_digest: Digest,
}

/// Result of publishing a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPolicy {
    /// Content digest
    pub policy_hash: Digest,
    /// Sequence of the publication entry
    pub sequence: Sequence,
}

/// Result of activating or rolling back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedPolicy {
    /// Newly active version
    pub policy_hash: Digest,
    /// Version it replaced
    pub previous: Option<Digest>,
    /// Forward or rollback
    pub mode: ActivationMode,
    /// Sequence of the activation entry
    pub sequence: Sequence,
}

/// Entry point for governance operations over one ledger
pub struct GovernanceKernel<'a> {
    store: &'a LedgerStore,
    keys: &'a KeyManager,
    guard: &'a TokenGuard,
    clock: &'a dyn Clock,
    required_approvals: usize,
}

impl<'a> GovernanceKernel<'a> {
    /// Borrow the pieces a governance operation touches
    ///
    /// `required_approvals` applies to publish, activate and rollback.
    pub fn new(
        store: &'a LedgerStore,
        keys: &'a KeyManager,
        guard: &'a TokenGuard,
        clock: &'a dyn Clock,
        required_approvals: usize,
    ) -> Self {
        Self {
            store,
            keys,
            guard,
            clock,
            required_approvals,
        }
    }

    /// Governance state replayed from the ledger as it stands
    pub fn state(&self) -> Result<GovernanceState> {
        GovernanceState::replay(&self.store.snapshot().entries, self.store.algorithm())
    }

    /// Evaluate against the active policy without recording
    pub fn evaluate(&self, pending: PendingDecision) -> Result<EvaluatedDecision> {
        let state = self.state()?;
        let active = state
            .active()
            .ok_or_else(|| VigilError::policy_version("no policy version is active"))?;
        pending.evaluate(active, self.keys, self.clock)
    }

    /// Evaluate and record in one step
    pub fn decide(
        &self,
        pending: PendingDecision,
        token: &GovernanceToken,
    ) -> Result<RecordedDecision> {
        let evaluated = self.evaluate(pending)?;
        let grant = self.guard.consume(token, TokenScope::Append, 0, self.clock.now())?;
        evaluated
            .record(self.store, self.keys, grant)
            .map_err(|(_, e)| e)
    }

    /// Append an immutable policy version
    pub fn publish_policy(
        &self,
        version: PolicyVersion,
        token: &GovernanceToken,
    ) -> Result<PublishedPolicy> {
        version.validate()?;
        let policy_hash = version.hash(self.store.algorithm())?;
        let state = self.state()?;
        if state.version(&policy_hash).is_some() {
            return Err(VigilError::policy_version(format!(
                "policy {} is already published",
                policy_hash.short()
            )));
        }
        if let Some(predecessor) = &version.predecessor {
            require_version(&state, predecessor)?;
        }

        let grant = self.consume(token, TokenScope::Publish)?;
        let label = version.label.clone();
        let record = PolicyPublished {
            record_type: POLICY_PUBLISHED.to_owned(),
            policy_hash,
            version,
        };
        let entry = self.store.append(&record, self.keys, grant)?;
        info!(policy = %policy_hash.short(), %label, sequence = entry.sequence, "policy published");
        Ok(PublishedPolicy {
            policy_hash,
            sequence: entry.sequence,
        })
    }

    /// Move forward to a published successor of the active version
    pub fn activate_policy(
        &self,
        target: Digest,
        reason: &str,
        token: &GovernanceToken,
    ) -> Result<ActivatedPolicy> {
        let state = self.state()?;
        let published = require_version(&state, &target)?;
        let current = state.active_hash();
        if current == Some(target) {
            return Err(VigilError::policy_version(format!(
                "policy {} is already active",
                target.short()
            )));
        }
        if current.is_some() && published.version.predecessor != current {
            return Err(VigilError::policy_version(format!(
                "policy {} does not succeed the active version; \
                 use rollback to return to an earlier one",
                target.short()
            )));
        }
        self.check_publisher(published)?;

        let grant = self.consume(token, TokenScope::Publish)?;
        self.append_activation(target, current, ActivationMode::Activate, reason, grant)
    }

    /// Reactivate an earlier version
    ///
    /// The token must carry rollback authority. The target must have been
    /// active before, and its publishing key must still verify under the
    /// current key lineage.
    pub fn rollback(
        &self,
        target: Digest,
        reason: &str,
        token: &GovernanceToken,
    ) -> Result<ActivatedPolicy> {
        if !token.has_scope(TokenScope::Rollback) {
            return Err(VigilError::policy_version(
                "governance token lacks rollback authority",
            ));
        }
        let state = self.state()?;
        let published = require_version(&state, &target)?;
        let current = state.active_hash();
        if current == Some(target) {
            return Err(VigilError::policy_version(format!(
                "policy {} is already active",
                target.short()
            )));
        }
        if !state.was_active(&target) {
            return Err(VigilError::policy_version(format!(
                "policy {} was never active; activate it instead",
                target.short()
            )));
        }
        self.check_publisher(published)?;

        let grant = self.consume(token, TokenScope::Rollback)?;
        self.append_activation(target, current, ActivationMode::Rollback, reason, grant)
    }

    fn consume(&self, token: &GovernanceToken, scope: TokenScope) -> Result<ConsumedGrant> {
        self.guard
            .consume(token, scope, self.required_approvals, self.clock.now())
    }

    /// Refuse versions whose publication no longer verifies
    fn check_publisher(&self, published: &PublishedVersion) -> Result<()> {
        let lineage = self.keys.lineage();
        let revoked = lineage
            .get(&published.publisher)
            .map_or(true, |k| k.status == KeyStatus::Revoked);
        let entry = self.store.read(published.sequence)?;
        let verified = !revoked
            && self
                .keys
                .verify(&entry.digest, &entry.signature, &entry.key_id, entry.sequence)
                .unwrap_or(false);
        if verified {
            Ok(())
        } else {
            warn!(
                policy = %published.policy_hash.short(),
                publisher = %published.publisher,
                "policy publisher no longer verifies"
            );
            Err(VigilError::policy_version(format!(
                "policy {} was published by key {} which no longer verifies",
                published.policy_hash.short(),
                published.publisher
            )))
        }
    }

    fn append_activation(
        &self,
        target: Digest,
        previous: Option<Digest>,
        mode: ActivationMode,
        reason: &str,
        grant: ConsumedGrant,
    ) -> Result<ActivatedPolicy> {
        let approvals: BTreeSet<String> = grant.approvals().clone();
        let record = PolicyActivated {
            record_type: POLICY_ACTIVATED.to_owned(),
            policy_hash: target,
            previous,
            mode,
            reason: reason.trim().to_owned(),
            approvals,
        };
        let entry = self.store.append(&record, self.keys, grant)?;
        info!(
            policy = %target.short(),
            ?mode,
            sequence = entry.sequence,
            "policy activated"
        );
        Ok(ActivatedPolicy {
            policy_hash: target,
            previous,
            mode,
            sequence: entry.sequence,
        })
    }
}

impl std::fmt::Debug for GovernanceKernel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceKernel")
            .field("store", &self.store)
            .field("required_approvals", &self.required_approvals)
            .finish_non_exhaustive()
    }
}
