#![forbid(unsafe_code)]
//! # Vigil Ledger
//!
//! The source of truth: an append-only file of signed, hash-chained entries,
//! plus two derived views that can always be rebuilt from it:
//!
//! - [`merkle`]: incremental Merkle accumulator with a persisted node log
//! - [`index`]: sequence/digest to frame-offset lookup behind a backend trait
//!
//! Appends require a [`vigil_guards::ConsumedGrant`]; there is no update or
//! delete path.

pub mod entry;
pub mod index;
pub mod merkle;
pub mod store;

pub use entry::{compute_entry_digest, CanonicalPayload, FrameLocation, LedgerEntry};
pub use index::{
    open_backend, records_from_ledger, FileIndex, IndexBackend, IndexKey, IndexRecord,
    MemoryIndex,
};
pub use merkle::{MerkleAccumulator, MerkleFrontier, MerkleNode, MerkleStateFile};
pub use store::{
    first_chain_fault, DerivedInstall, DerivedState, LedgerSnapshot, LedgerStore, StoreOptions,
    UnreadableFrame,
};
