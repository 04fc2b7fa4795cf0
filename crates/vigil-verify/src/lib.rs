#![forbid(unsafe_code)]
//! # Vigil Verify
//!
//! Jobs that check and restore the ledger's derived state. Each runs over a
//! [`vigil_ledger::LedgerSnapshot`], so writers are never blocked and an
//! entry committed mid-job is simply outside that job's result.
//!
//! - [`divergence`]: recompute everything and report every mismatch
//! - [`repair`]: rebuild index and Merkle state from an intact chain
//! - [`replay`]: segment-parallel Merkle replay on a fixed worker pool
//! - [`audit`]: artifact digests against a trusted reference set
//! - [`snapshot`]: bundle export, and restore gated on a clean scan
//!
//! Nothing here writes a ledger entry.

pub mod audit;
pub mod divergence;
pub mod repair;
pub mod replay;
pub mod snapshot;

pub use audit::{
    pinned_artifacts, reproducibility_audit, ArtifactAudit, ArtifactStatus, AuditReport,
    PinnedArtifact, ReferenceSet,
};
pub use divergence::{
    divergence_scan, ChainBreak, DigestMismatch, DivergenceReport, IndexDivergence,
    MerkleDivergence, RootCause, SignatureFailure, TimestampRegression,
};
pub use repair::{auto_repair, RepairReport};
pub use replay::{parallel_replay, ReplayOptions, ReplayReport, SegmentSummary};
pub use snapshot::{
    export_snapshot, load_bundle, restore_snapshot, RestoreReport, SnapshotBundle, SnapshotExport,
};
