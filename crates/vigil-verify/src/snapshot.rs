//! Snapshot bundles
//!
//! A bundle is a versioned, self-contained copy of the ledger frames plus the
//! derived index and Merkle state. Restoring stages the bundle beside the
//! live files, opens a store on the staged copy and runs a full divergence
//! scan. Only a clean scan promotes the staged files over the live ones.

use crate::divergence::{divergence_scan, DivergenceReport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use vigil_core::persist::{read_optional, write_atomic};
use vigil_core::{
    codec, CancellationToken, Clock, DataPaths, Digest, HashAlgorithmId, IndexBackendKind, Result,
    Timestamp, VigilError,
};
use vigil_guards::{ConsumedGrant, TokenScope};
use vigil_ledger::merkle::{append_node_log, write_state};
use vigil_ledger::{
    open_backend, IndexRecord, LedgerStore, MerkleNode, MerkleStateFile, StoreOptions,
};
use vigil_signature::KeyManager;

/// Current bundle format
pub const BUNDLE_VERSION: u32 = 1;

/// Directory, under the data root, where restores are staged
pub const STAGING_DIR: &str = "restore-staging";

/// Exported ledger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    /// Format version
    pub version: u32,
    /// Export time
    pub created_at: Timestamp,
    /// Digest algorithm of the ledger
    pub algorithm: HashAlgorithmId,
    /// Entries in the bundle
    pub entries: u64,
    /// Merkle root at export
    pub merkle_root: Digest,
    /// Ledger frames exactly as stored, without their newline
    pub ledger: Vec<String>,
    /// Index records at export
    pub index: Vec<IndexRecord>,
    /// Merkle state file at export
    pub merkle_state: Option<MerkleStateFile>,
    /// Merkle node log at export
    pub merkle_nodes: Vec<MerkleNode>,
}

/// Result of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotExport {
    /// Bundle written
    pub path: PathBuf,
    /// Entries exported
    pub entries: u64,
    /// Merkle root at export
    pub merkle_root: Digest,
    /// Digest of the bundle file
    pub bundle_digest: Digest,
}

/// Result of a restore attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Bundle read
    pub bundle: PathBuf,
    /// Export time recorded in the bundle
    pub bundle_created_at: Timestamp,
    /// Entries in the bundle
    pub entries: u64,
    /// Root recorded in the bundle
    pub bundle_root: Digest,
    /// Root of the staged store
    pub restored_root: Digest,
    /// Scan of the staged store
    pub scan: DivergenceReport,
    /// Whether the staged files replaced the live ones
    pub accepted: bool,
}

/// Write a bundle of the store's current committed state to `dest`
pub fn export_snapshot(store: &LedgerStore, dest: &Path) -> Result<SnapshotExport> {
    let snapshot = store.snapshot();
    let bytes = read_optional(&store.options().paths.ledger)?.unwrap_or_default();

    let mut ledger = Vec::with_capacity(snapshot.frames.len());
    for location in snapshot.frames.iter() {
        let start = usize::try_from(location.offset)
            .map_err(|_| VigilError::invalid("frame offset exceeds address space"))?;
        let end = usize::try_from(location.offset + location.length)
            .map_err(|_| VigilError::invalid("frame end exceeds address space"))?;
        let frame = bytes
            .get(start..end.saturating_sub(1))
            .ok_or_else(|| VigilError::storage("ledger file shorter than its committed frames"))?;
        let line = std::str::from_utf8(frame)
            .map_err(|e| VigilError::serialization(format!("ledger frame is not UTF-8: {e}")))?;
        ledger.push(line.to_owned());
    }

    let bundle = SnapshotBundle {
        version: BUNDLE_VERSION,
        created_at: store.clock().now(),
        algorithm: snapshot.algorithm,
        entries: snapshot.entries.len() as u64,
        merkle_root: snapshot.merkle.root(),
        ledger,
        index: snapshot.index.clone(),
        merkle_state: snapshot.merkle_state.clone(),
        merkle_nodes: snapshot.merkle.nodes().collect(),
    };
    let encoded = codec::encode(&bundle)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    write_atomic(dest, &encoded)?;

    let export = SnapshotExport {
        path: dest.to_path_buf(),
        entries: bundle.entries,
        merkle_root: bundle.merkle_root,
        bundle_digest: snapshot.algorithm.hash(&encoded),
    };
    info!(
        path = %dest.display(),
        entries = export.entries,
        root = %export.merkle_root.short(),
        "snapshot exported"
    );
    Ok(export)
}

/// Read and check a bundle file
pub fn load_bundle(path: &Path) -> Result<SnapshotBundle> {
    let bytes = read_optional(path)?
        .ok_or_else(|| VigilError::not_found(format!("snapshot bundle {}", path.display())))?;
    let bundle: SnapshotBundle = codec::decode(&bytes)?;
    if bundle.version != BUNDLE_VERSION {
        return Err(VigilError::invalid(format!(
            "snapshot bundle version {} unsupported",
            bundle.version
        )));
    }
    if bundle.entries != bundle.ledger.len() as u64 {
        return Err(VigilError::invalid(format!(
            "bundle declares {} entries but holds {} frames",
            bundle.entries,
            bundle.ledger.len()
        )));
    }
    Ok(bundle)
}

fn stage(bundle: &SnapshotBundle, staging: &DataPaths) -> Result<()> {
    fs::create_dir_all(&staging.root)?;

    let mut ledger = Vec::new();
    for line in &bundle.ledger {
        ledger.extend_from_slice(line.as_bytes());
        ledger.push(b'\n');
    }
    write_atomic(&staging.ledger, &ledger)?;
    append_node_log(&staging.merkle_nodes, &bundle.merkle_nodes)?;
    if let Some(state) = &bundle.merkle_state {
        write_state(&staging.merkle_state, state)?;
    }
    open_backend(IndexBackendKind::File, &staging.index)?.rebuild(bundle.index.clone())?;
    Ok(())
}

fn promote(staging: &DataPaths, live: &DataPaths) -> Result<()> {
    fs::create_dir_all(&live.root)?;
    fs::rename(&staging.index, &live.index)?;
    fs::rename(&staging.merkle_nodes, &live.merkle_nodes)?;
    if staging.merkle_state.exists() {
        fs::rename(&staging.merkle_state, &live.merkle_state)?;
    } else if live.merkle_state.exists() {
        fs::remove_file(&live.merkle_state)?;
    }
    // The ledger goes last: until it moves, the old ledger is still live and
    // the derived files are rebuilt from it on the next repair.
    fs::rename(&staging.ledger, &live.ledger)?;
    Ok(())
}

fn discard(staging: &DataPaths) {
    if let Err(e) = fs::remove_dir_all(&staging.root) {
        if staging.root.exists() {
            warn!(path = %staging.root.display(), error = %e, "staging directory not removed");
        }
    }
}

/// Restore a bundle over the live files under `live.root`
///
/// Needs a grant consumed for [`TokenScope::Repair`]. The live files are
/// only replaced when the staged copy scans clean against `keys` and
/// reproduces the bundle's Merkle root. A bundle that ends before a key
/// rotation the lineage already records is refused, since entries appended
/// after it would be signed by a key the restored ledger never activated.
/// Nothing may append to `live` while this runs, and an open store must be
/// reopened after an accepted restore.
pub fn restore_snapshot(
    bundle_path: &Path,
    live: &DataPaths,
    options: &StoreOptions,
    keys: &KeyManager,
    grant: &ConsumedGrant,
    clock: Arc<dyn Clock>,
    cancel: &dyn CancellationToken,
) -> Result<RestoreReport> {
    grant.require(TokenScope::Repair)?;
    let bundle = load_bundle(bundle_path)?;
    if bundle.algorithm != options.algorithm {
        return Err(VigilError::invalid(format!(
            "bundle uses {} but the ledger is configured for {}",
            bundle.algorithm, options.algorithm
        )));
    }
    let lineage = keys.lineage();
    if let Some(key) = lineage.keys.iter().find(|k| k.activated_from > bundle.entries) {
        return Err(VigilError::invalid(format!(
            "bundle ends at {} entries but key {} signs from sequence {}; \
             export a bundle that includes its rotation",
            bundle.entries, key.key_id, key.activated_from
        )));
    }

    let staging = DataPaths::new(&live.root.join(STAGING_DIR));
    if staging.root.exists() {
        fs::remove_dir_all(&staging.root)?;
    }

    let checked = stage(&bundle, &staging).and_then(|()| {
        let store = LedgerStore::open(
            StoreOptions {
                paths: staging.clone(),
                algorithm: options.algorithm,
                index_backend: options.index_backend,
            },
            clock,
        )?;
        let scan = divergence_scan(&store.snapshot(), keys, cancel)?;
        Ok((scan, store.merkle_root()))
    });
    let (scan, restored_root) = match checked {
        Ok(checked) => checked,
        Err(e) => {
            discard(&staging);
            return Err(e);
        }
    };

    let accepted = scan.is_clean() && restored_root == bundle.merkle_root;
    if accepted {
        if let Err(e) = promote(&staging, live) {
            error!(error = %e, "snapshot promotion failed; run auto repair before appending");
            discard(&staging);
            return Err(e);
        }
        info!(entries = bundle.entries, root = %restored_root.short(), "snapshot restored");
    } else {
        error!(
            root_cause = ?scan.root_cause,
            bundle_root = %bundle.merkle_root.short(),
            restored_root = %restored_root.short(),
            "snapshot rejected; live state left untouched"
        );
    }
    discard(&staging);

    Ok(RestoreReport {
        bundle: bundle_path.to_path_buf(),
        bundle_created_at: bundle.created_at,
        entries: bundle.entries,
        bundle_root: bundle.merkle_root,
        restored_root,
        scan,
        accepted,
    })
}
