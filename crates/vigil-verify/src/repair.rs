//! Auto-repair of derived state
//!
//! Rebuilds the Merkle accumulator and the index from the ledger entries and
//! installs them. Ledger entries are never touched: a ledger with a broken
//! chain is reported and left alone.

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use vigil_core::persist::write_atomic;
use vigil_core::{codec, CancellationToken, Digest, Result, Timestamp, VigilError};
use vigil_ledger::{
    first_chain_fault, records_from_ledger, DerivedState, LedgerStore, MerkleAccumulator,
};

/// Summary of a repair, also written to the repair report file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// When the rebuilt state was installed
    pub repaired_at: Timestamp,
    /// Entries the rebuild was computed from
    pub entries_replayed: u64,
    /// Entries committed while the rebuild ran and folded in on install
    pub caught_up: u64,
    /// Index records before the repair
    pub index_records_before: u64,
    /// Index records after the repair
    pub index_records: u64,
    /// Root in the state file before the repair, if there was one
    pub merkle_root_before: Option<Digest>,
    /// Root after the repair
    pub merkle_root_after: Digest,
}

/// Rebuild Merkle and index state from the ledger
///
/// Fails with `ChainBreak` when the ledger itself is damaged; derived state
/// is only ever rebuilt from an intact chain.
pub fn auto_repair(store: &LedgerStore, cancel: &dyn CancellationToken) -> Result<RepairReport> {
    let snapshot = store.snapshot();
    let algorithm = snapshot.algorithm;

    if let Some(frame) = &snapshot.unreadable {
        let previous = snapshot.entries.last().map_or(Digest::ZERO, |e| e.digest);
        error!(sequence = frame.sequence, "repair refused: undecodable ledger frame");
        return Err(VigilError::chain_break(frame.sequence, previous, Digest::ZERO));
    }
    if let Some(fault) = first_chain_fault(&snapshot.entries, algorithm) {
        error!(error = %fault, "repair refused: ledger chain is broken");
        return Err(fault);
    }
    if let Some(sealed) = store.sealed() {
        error!(error = %sealed, "repair refused: store is sealed");
        return Err(sealed);
    }

    let merkle_root_before = snapshot.merkle_state.as_ref().map(|s| s.root);
    let index_records_before = snapshot.index.len() as u64;

    cancel.checkpoint("auto repair: merkle")?;
    let merkle = MerkleAccumulator::from_entry_digests(
        algorithm,
        snapshot.entries.iter().map(|e| &e.digest),
    );
    cancel.checkpoint("auto repair: index")?;
    let records = records_from_ledger(&snapshot.entries, &snapshot.frames);
    cancel.checkpoint("auto repair: install")?;

    let installed = store.install_derived(DerivedState { merkle, records })?;
    let report = RepairReport {
        repaired_at: store.clock().now(),
        entries_replayed: snapshot.entries.len() as u64,
        caught_up: installed.caught_up,
        index_records_before,
        index_records: installed.index_records,
        merkle_root_before,
        merkle_root_after: store.merkle_root(),
    };

    let path = &store.options().paths.repair_report;
    write_atomic(path, &codec::encode(&report)?)?;
    info!(
        entries = report.entries_replayed,
        index_records = report.index_records,
        root = %report.merkle_root_after.short(),
        path = %path.display(),
        "auto repair complete"
    );
    Ok(report)
}
