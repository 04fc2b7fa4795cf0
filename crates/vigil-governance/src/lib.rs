#![forbid(unsafe_code)]
//! # Vigil Governance
//!
//! Policy versions, quorum simulation and signed decision receipts. Every
//! governance fact (publication, activation, rollback, decision) is a ledger
//! entry; [`GovernanceState`] rebuilds the current picture by replay, so the
//! active policy is never a pointer that can drift from the ledger.

pub mod kernel;
pub mod policy;
pub mod quorum;
pub mod receipt;
pub mod state;

pub use kernel::{
    ActivatedPolicy, EvaluatedDecision, GovernanceKernel, PendingDecision, PublishedPolicy,
    RecordedDecision,
};
pub use policy::{
    ActionDescriptor, ActivationMode, DecisionContext, PolicyActivated, PolicyPublished,
    PolicyRule, PolicyVersion, QuorumPolicy, RuleEffect, ANY_ACTION, POLICY_ACTIVATED,
    POLICY_PUBLISHED,
};
pub use quorum::{tally, QuorumOutcome, QuorumTally, Vote};
pub use receipt::{
    semantic_diff, DecisionBody, DecisionReceipt, FieldDifference, Verdict, DECISION_RECORDED,
};
pub use state::{
    governance_replay, Activation, GovernanceReplayReport, GovernanceState, PublishedVersion,
    RotationSummary,
};
