#![forbid(unsafe_code)]
//! # Vigil Runtime
//!
//! The single [`LedgerContext`] that owns the store, key manager and token
//! guard, and the command surface built on it. Every command returns a
//! [`CommandReport`] instead of panicking or exiting.

pub mod commands;
pub mod context;
pub mod report;

pub use commands::{
    default_bundle_path, AppendOutcome, DecisionOutcome, DecisionRequest, IssuedToken,
    LedgerStatus, ReceiptDiff,
};
pub use context::LedgerContext;
pub use report::{CommandReport, ErrorReport};
