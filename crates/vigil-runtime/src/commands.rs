//! Command surface
//!
//! One method per operator command. Each takes explicit arguments, never
//! panics on bad input, and returns a [`CommandReport`]. Governance tokens
//! arrive as their encoded string and are checked by the token guard here;
//! the runtime never issues one unless `issue-token` is invoked.

use crate::context::LedgerContext;
use crate::report::CommandReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vigil_core::{
    CancellationToken, Digest, KeyId, Result, Sequence, Timestamp, TokenFailure, VigilError,
};
use vigil_governance::{
    governance_replay, semantic_diff, ActionDescriptor, ActivatedPolicy, DecisionContext,
    DecisionReceipt, FieldDifference, GovernanceReplayReport, PendingDecision, PolicyVersion,
    PublishedPolicy, Vote, DECISION_RECORDED,
};
use vigil_guards::{GovernanceToken, GuardStatus, TokenScope};
use vigil_ledger::StoreOptions;
use vigil_signature::{KeyLineage, RevocationRecord, RotationOutcome};
use vigil_verify::{
    auto_repair, divergence_scan, export_snapshot, parallel_replay, pinned_artifacts,
    reproducibility_audit, restore_snapshot, ArtifactStatus, ReferenceSet, ReplayOptions,
};

/// A decision request as supplied by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Action to decide on
    pub action: ActionDescriptor,
    /// Context the policy rules match against
    #[serde(default)]
    pub context: DecisionContext,
    /// Votes for quorum simulation
    #[serde(default)]
    pub votes: Vec<Vote>,
}

/// Result of `append`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    /// Assigned sequence
    pub sequence: Sequence,
    /// Entry digest
    pub digest: Digest,
    /// Entry timestamp
    pub timestamp: Timestamp,
    /// Signing key
    pub key_id: KeyId,
    /// Merkle root after the append
    pub merkle_root: Digest,
}

/// Result of `issue-token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Encoded token to hand to the operator
    pub token: String,
    /// Token nonce
    pub nonce: String,
    /// Expiry
    pub expires_at: Option<Timestamp>,
    /// Authorized operations
    pub scopes: Vec<TokenScope>,
}

/// Result of `evaluate-decision`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    /// Signed receipt
    pub receipt: DecisionReceipt,
    /// Sequence of the receipt entry, when recorded
    pub sequence: Option<Sequence>,
    /// Digest of that entry
    pub entry_digest: Option<Digest>,
}

/// Result of `diff-receipts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDiff {
    /// Left receipt sequence
    pub left: Sequence,
    /// Right receipt sequence
    pub right: Sequence,
    /// Differing fields, sorted by path
    pub differences: Vec<FieldDifference>,
}

/// Result of `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    /// Committed entries
    pub entries: u64,
    /// Digest of the last entry
    pub head: Option<Digest>,
    /// Current Merkle root
    pub merkle_root: Digest,
    /// Why appends are refused, if they are
    pub sealed: Option<String>,
    /// Active signing key
    pub active_key: KeyId,
    /// Full key lineage
    pub lineage: KeyLineage,
    /// Token guard bookkeeping
    pub tokens: GuardStatus,
}

fn presented(token: Option<&str>) -> Result<GovernanceToken> {
    let raw = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| VigilError::token(TokenFailure::Missing, "no governance token presented"))?;
    GovernanceToken::parse(raw)
}

impl LedgerContext {
    fn report<T: Serialize>(&self, command: &str, result: Result<T>) -> CommandReport {
        match &result {
            Ok(_) => info!(command, "command succeeded"),
            Err(e) => warn!(command, kind = ?e.kind(), error = %e, "command failed"),
        }
        CommandReport::from_result(command, self.clock().now(), result)
    }

    /// `status`: a summary of the ledger, keys and tokens
    pub fn status(&self) -> CommandReport {
        let store = self.store();
        let status = LedgerStatus {
            entries: store.len() as u64,
            head: store.head().map(|e| e.digest),
            merkle_root: store.merkle_root(),
            sealed: store.sealed().map(|e| e.to_string()),
            active_key: self.keys().active_key_id(),
            lineage: self.keys().lineage(),
            tokens: self.guard().status(),
        };
        self.report("status", Ok(status))
    }

    /// `issue-token`: mint a token for explicit operator use
    pub fn issue_token(
        &self,
        scopes: &[TokenScope],
        approvals: &[String],
        ttl_secs: Option<u64>,
    ) -> CommandReport {
        let result = self
            .guard()
            .issue(
                ttl_secs.unwrap_or(self.config().token.default_ttl_secs),
                scopes.iter().copied(),
                approvals.iter().cloned(),
                self.clock().now(),
            )
            .and_then(|token| {
                Ok(IssuedToken {
                    token: token.encode()?,
                    nonce: token.nonce.to_string(),
                    expires_at: token.expires_at(),
                    scopes: token.scopes.iter().copied().collect(),
                })
            });
        self.report("issue-token", result)
    }

    /// `append`: write a payload to the ledger
    pub fn append(&self, payload: &Value, token: Option<&str>) -> CommandReport {
        let result = (|| -> Result<AppendOutcome> {
            let _gate = self.write_gate();
            let store = self.store();
            if let Some(reason) = store.sealed() {
                return Err(reason);
            }
            let grant = self
                .guard()
                .consume_presented(token, TokenScope::Append, 0, self.clock().now())?;
            let entry = store.append(payload, self.keys(), grant)?;
            Ok(AppendOutcome {
                sequence: entry.sequence,
                digest: entry.digest,
                timestamp: entry.timestamp,
                key_id: entry.key_id,
                merkle_root: store.merkle_root(),
            })
        })();
        self.report("append", result)
    }

    /// `publish-policy`: append an immutable policy version
    pub fn publish_policy(&self, version: PolicyVersion, token: Option<&str>) -> CommandReport {
        let result = (|| -> Result<PublishedPolicy> {
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            self.kernel(&store).publish_policy(version, &token)
        })();
        self.report("publish-policy", result)
    }

    /// `activate-policy`: move forward to a published successor
    pub fn activate_policy(
        &self,
        target: Digest,
        reason: &str,
        token: Option<&str>,
    ) -> CommandReport {
        let result = (|| -> Result<ActivatedPolicy> {
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            self.kernel(&store).activate_policy(target, reason, &token)
        })();
        self.report("activate-policy", result)
    }

    /// `rollback-policy`: reactivate an earlier version
    pub fn rollback_policy(
        &self,
        target: Digest,
        reason: &str,
        token: Option<&str>,
    ) -> CommandReport {
        let result = (|| -> Result<ActivatedPolicy> {
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            self.kernel(&store).rollback(target, reason, &token)
        })();
        self.report("rollback-policy", result)
    }

    /// `evaluate-decision`: evaluate against the active policy
    ///
    /// With `record` the signed receipt is appended, which needs an append
    /// token; without it the evaluation is a dry run.
    pub fn evaluate_decision(
        &self,
        request: DecisionRequest,
        record: bool,
        token: Option<&str>,
    ) -> CommandReport {
        let result = (|| -> Result<DecisionOutcome> {
            let pending =
                PendingDecision::new(request.action, request.context).with_votes(request.votes);
            if !record {
                let store = self.store();
                let evaluated = self.kernel(&store).evaluate(pending)?;
                return Ok(DecisionOutcome {
                    receipt: evaluated.receipt().clone(),
                    sequence: None,
                    entry_digest: None,
                });
            }
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            let recorded = self.kernel(&store).decide(pending, &token)?;
            Ok(DecisionOutcome {
                receipt: recorded.receipt,
                sequence: Some(recorded.sequence),
                entry_digest: Some(recorded.entry_digest),
            })
        })();
        self.report("evaluate-decision", result)
    }

    /// `rotate-key`: replace the active signing key
    pub fn rotate_key(&self, reason: &str, token: Option<&str>) -> CommandReport {
        let result = (|| -> Result<RotationOutcome> {
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            self.keys().rotate(
                &store,
                self.guard(),
                &token,
                self.config().token.required_rotation_approvals,
                reason,
                self.clock().now(),
            )
        })();
        self.report("rotate-key", result)
    }

    /// `revoke-key`: revoke a retired key
    pub fn revoke_key(&self, key_id: &KeyId, reason: &str, token: Option<&str>) -> CommandReport {
        let result = (|| -> Result<RevocationRecord> {
            let token = presented(token)?;
            let _gate = self.write_gate();
            let store = self.store();
            self.keys().revoke(
                &store,
                self.guard(),
                &token,
                self.config().token.required_rotation_approvals,
                key_id,
                reason,
                self.clock().now(),
            )
        })();
        self.report("revoke-key", result)
    }

    /// `divergence-scan`: report every mismatch between ledger and derived state
    pub fn divergence_scan(&self, cancel: &dyn CancellationToken) -> CommandReport {
        let snapshot = self.store().snapshot();
        match divergence_scan(&snapshot, self.keys(), cancel) {
            Ok(report) => {
                let problem = report.to_error();
                CommandReport::completed("divergence-scan", self.clock().now(), &report, problem)
            }
            Err(e) => self.report::<()>("divergence-scan", Err(e)),
        }
    }

    /// `auto-repair`: rebuild index and Merkle state from the ledger
    pub fn auto_repair(&self, cancel: &dyn CancellationToken) -> CommandReport {
        let result = {
            let _gate = self.write_gate();
            auto_repair(&self.store(), cancel)
        };
        self.report("auto-repair", result)
    }

    /// `reproducibility-capture`: pin the current artifact digests
    pub fn capture_reference(
        &self,
        out: &Path,
        toolchain_manifest: Option<&Path>,
    ) -> CommandReport {
        let artifacts = pinned_artifacts(&self.config().paths(), toolchain_manifest);
        let result = ReferenceSet::capture(&artifacts, self.config().hash_algorithm)
            .and_then(|reference| reference.save(out).map(|()| reference));
        self.report("reproducibility-capture", result)
    }

    /// `reproducibility-audit`: compare pinned artifacts with a reference set
    pub fn reproducibility_audit(
        &self,
        reference: &Path,
        toolchain_manifest: Option<&Path>,
    ) -> CommandReport {
        let artifacts = pinned_artifacts(&self.config().paths(), toolchain_manifest);
        let audited = ReferenceSet::load(reference)
            .and_then(|reference| reproducibility_audit(&artifacts, &reference));
        match audited {
            Ok(report) => {
                let failing: Vec<String> = report
                    .artifacts
                    .iter()
                    .filter(|a| a.status != ArtifactStatus::Match)
                    .map(|a| format!("{} ({:?})", a.name, a.status))
                    .collect();
                let problem = (!failing.is_empty()).then(|| {
                    VigilError::invalid(format!(
                        "artifacts differ from reference: {}",
                        failing.join(", ")
                    ))
                });
                let now = self.clock().now();
                CommandReport::completed("reproducibility-audit", now, &report, problem)
            }
            Err(e) => self.report::<()>("reproducibility-audit", Err(e)),
        }
    }

    /// `parallel-replay`: recompute the Merkle root on a worker pool
    ///
    /// A blown time budget is reported in the data but does not fail the
    /// command; a root that differs from the persisted one does.
    pub fn parallel_replay(
        &self,
        workers: Option<usize>,
        segments: Option<usize>,
        cancel: &dyn CancellationToken,
    ) -> CommandReport {
        let mut options = ReplayOptions::from_config(&self.config().replay);
        options.workers = workers.unwrap_or(options.workers);
        options.segments = segments.unwrap_or(options.segments);
        let snapshot = self.store().snapshot();
        match parallel_replay(&snapshot, options, cancel) {
            Ok(report) => {
                let problem = match (&snapshot.merkle_state, report.matches_persisted) {
                    (Some(state), Some(false)) => Some(VigilError::merkle_divergence(
                        state.root,
                        report.merkle_root,
                        None,
                    )),
                    _ => None,
                };
                CommandReport::completed("parallel-replay", self.clock().now(), &report, problem)
            }
            Err(e) => self.report::<()>("parallel-replay", Err(e)),
        }
    }

    /// `snapshot-export`: write a bundle of the committed state
    pub fn snapshot_export(&self, dest: &Path) -> CommandReport {
        let result = export_snapshot(&self.store(), dest);
        self.report("snapshot-export", result)
    }

    /// `snapshot-restore`: replace live state with a bundle that scans clean
    pub fn snapshot_restore(
        &self,
        bundle: &Path,
        token: Option<&str>,
        cancel: &dyn CancellationToken,
    ) -> CommandReport {
        let _gate = self.write_gate();
        let grant = match self.guard().consume_presented(
            token,
            TokenScope::Repair,
            self.config().token.required_policy_approvals,
            self.clock().now(),
        ) {
            Ok(grant) => grant,
            Err(e) => return self.report::<()>("snapshot-restore", Err(e)),
        };
        let options = StoreOptions::from_config(self.config());
        let restored = restore_snapshot(
            bundle,
            &options.paths,
            &options,
            self.keys(),
            &grant,
            self.shared_clock(),
            cancel,
        );
        match restored {
            Ok(report) if report.accepted => {
                let reopened = self.reopen_store().err();
                let now = self.clock().now();
                CommandReport::completed("snapshot-restore", now, &report, reopened)
            }
            Ok(report) => {
                let problem = report.scan.to_error().unwrap_or_else(|| {
                    VigilError::merkle_divergence(report.bundle_root, report.restored_root, None)
                });
                let now = self.clock().now();
                CommandReport::completed("snapshot-restore", now, &report, Some(problem))
            }
            Err(e) => self.report::<()>("snapshot-restore", Err(e)),
        }
    }

    /// `governance-replay`: replay the ledger and summarize governance history
    pub fn governance_replay(&self) -> CommandReport {
        let store = self.store();
        let result: Result<GovernanceReplayReport> =
            governance_replay(&store.snapshot().entries, store.algorithm());
        self.report("governance-replay", result)
    }

    /// `diff-receipts`: field-by-field difference of two recorded receipts
    pub fn diff_receipts(&self, left: Sequence, right: Sequence) -> CommandReport {
        let result = (|| -> Result<ReceiptDiff> {
            let store = self.store();
            let load = |sequence: Sequence| -> Result<Value> {
                let entry = store.read(sequence)?;
                if entry.payload.record_type() != Some(DECISION_RECORDED) {
                    return Err(VigilError::invalid(format!(
                        "sequence {sequence} does not hold a decision receipt"
                    )));
                }
                let receipt: DecisionReceipt = entry.payload.decode()?;
                Ok(serde_json::to_value(receipt)?)
            };
            Ok(ReceiptDiff {
                left,
                right,
                differences: semantic_diff(&load(left)?, &load(right)?),
            })
        })();
        self.report("diff-receipts", result)
    }
}

/// Default bundle location under the data directory
pub fn default_bundle_path(context: &LedgerContext, created_at: Timestamp) -> PathBuf {
    context
        .config()
        .data_dir
        .join("snapshots")
        .join(format!("snapshot-{}.json", created_at.unix_millis()))
}
