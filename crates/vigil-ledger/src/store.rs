//! Ledger store: the single authoritative writer
//!
//! Concurrency model:
//!
//! - `writer` (mutex) serializes appends and owns the file handle. At most one
//!   append is in flight; others block on the mutex.
//! - `committed` (rwlock) holds the last fully committed state. An entry only
//!   becomes visible here after its frame has been written and synced, so
//!   readers never observe a partial entry.
//! - [`LedgerSnapshot`] clones `Arc`s out of `committed`; later appends
//!   copy-on-write, leaving the snapshot untouched.
//!
//! Merkle and index updates follow the ledger commit. A failure to persist
//! them is logged and left for the divergence scan; it never undoes a
//! committed entry.

use crate::entry::{compute_entry_digest, CanonicalPayload, FrameLocation, LedgerEntry};
use crate::index::{open_backend, records_from_ledger, IndexBackend, IndexKey, IndexRecord};
use crate::merkle::{
    append_node_log, load_node_log, load_state, rewrite_node_log, write_state, MerkleAccumulator,
    MerkleStateFile,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::RangeBounds;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vigil_core::{
    Clock, DataPaths, Digest, HashAlgorithmId, IndexBackendKind, Result, Sequence, Signer,
    VigilConfig, VigilError,
};
use vigil_guards::ConsumedGrant;

/// Construction-time choices for a store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// File layout
    pub paths: DataPaths,
    /// Digest algorithm
    pub algorithm: HashAlgorithmId,
    /// Index backend
    pub index_backend: IndexBackendKind,
}

impl StoreOptions {
    /// Options implied by a configuration
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            paths: config.paths(),
            algorithm: config.hash_algorithm,
            index_backend: config.index_backend,
        }
    }
}

/// A complete frame that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableFrame {
    /// Sequence the frame would have had
    pub sequence: Sequence,
    /// Byte offset of the frame
    pub offset: u64,
    /// Decoder message
    pub message: String,
}

/// Rebuilt derived state handed back by repair
#[derive(Debug, Clone)]
pub struct DerivedState {
    /// Accumulator replayed from the ledger
    pub merkle: MerkleAccumulator,
    /// Index records replayed from the ledger
    pub records: Vec<IndexRecord>,
}

/// Result of installing rebuilt derived state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedInstall {
    /// Entries committed after the rebuild started, folded in under the lock
    pub caught_up: u64,
    /// Leaves in the installed accumulator
    pub leaf_count: u64,
    /// Records in the installed index
    pub index_records: u64,
}

/// Immutable view of committed state
#[derive(Clone)]
pub struct LedgerSnapshot {
    /// Digest algorithm of the ledger
    pub algorithm: HashAlgorithmId,
    /// Entries in sequence order
    pub entries: Arc<Vec<LedgerEntry>>,
    /// Frame locations, parallel to `entries`
    pub frames: Arc<Vec<FrameLocation>>,
    /// Accumulator as persisted in the node log
    pub merkle: Arc<MerkleAccumulator>,
    /// Persisted Merkle summary, if readable
    pub merkle_state: Option<MerkleStateFile>,
    /// Problems met while loading Merkle files
    pub merkle_problems: Vec<String>,
    /// Index content in sequence order
    pub index: Vec<IndexRecord>,
    /// First undecodable frame, if any
    pub unreadable: Option<UnreadableFrame>,
}

impl LedgerSnapshot {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for LedgerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSnapshot")
            .field("algorithm", &self.algorithm)
            .field("entries", &self.entries.len())
            .field("index", &self.index.len())
            .field("merkle_leaves", &self.merkle.leaf_count())
            .finish_non_exhaustive()
    }
}

struct WriterState {
    file: File,
    end_offset: u64,
    sealed: Option<VigilError>,
}

struct CommittedState {
    entries: Arc<Vec<LedgerEntry>>,
    frames: Arc<Vec<FrameLocation>>,
    merkle: Arc<MerkleAccumulator>,
    merkle_state: Option<MerkleStateFile>,
    merkle_problems: Vec<String>,
    index: Box<dyn IndexBackend>,
    unreadable: Option<UnreadableFrame>,
}

struct LoadedFrames {
    entries: Vec<LedgerEntry>,
    frames: Vec<FrameLocation>,
    committed_len: u64,
    unreadable: Option<UnreadableFrame>,
}

fn load_frames(bytes: &[u8]) -> LoadedFrames {
    let mut entries = Vec::new();
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut unreadable = None;
    while let Some(pos) = bytes[offset..].iter().position(|b| *b == b'\n') {
        let end = offset + pos + 1;
        let frame = &bytes[offset..end];
        match LedgerEntry::from_frame(frame) {
            Ok(entry) => {
                entries.push(entry);
                frames.push(FrameLocation {
                    offset: offset as u64,
                    length: frame.len() as u64,
                });
            }
            Err(e) => {
                unreadable = Some(UnreadableFrame {
                    sequence: entries.len() as u64,
                    offset: offset as u64,
                    message: e.to_string(),
                });
                break;
            }
        }
        offset = end;
    }
    let committed_len = if unreadable.is_some() {
        bytes.len() as u64
    } else {
        offset as u64
    };
    LoadedFrames {
        entries,
        frames,
        committed_len,
        unreadable,
    }
}

/// First structural fault in a run of entries, as a `ChainBreak`
///
/// Checks, per entry: gapless sequence, stored digest equals the digest
/// recomputed from its fields, and previous digest equals the recomputed
/// digest of its predecessor.
pub fn first_chain_fault(
    entries: &[LedgerEntry],
    algorithm: HashAlgorithmId,
) -> Option<VigilError> {
    let mut expected_previous = Digest::ZERO;
    for (position, entry) in entries.iter().enumerate() {
        let position = position as u64;
        if entry.previous_digest != expected_previous || entry.sequence != position {
            return Some(VigilError::chain_break(
                position,
                expected_previous,
                entry.previous_digest,
            ));
        }
        let recomputed = entry.recompute_digest(algorithm);
        if recomputed != entry.digest {
            return Some(VigilError::chain_break(position, recomputed, entry.digest));
        }
        expected_previous = recomputed;
    }
    None
}

/// Append-only, hash-chained ledger
pub struct LedgerStore {
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    writer: Mutex<WriterState>,
    committed: RwLock<CommittedState>,
}

impl LedgerStore {
    /// Open (or create) the ledger under `options.paths.root`
    ///
    /// A trailing frame without its newline is a torn write and is truncated.
    /// A broken chain or undecodable frame seals the store against appends.
    pub fn open(options: StoreOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let paths = &options.paths;
        fs::create_dir_all(&paths.root)?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&paths.ledger)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let loaded = load_frames(&bytes);
        if loaded.committed_len < bytes.len() as u64 {
            warn!(
                torn_bytes = bytes.len() as u64 - loaded.committed_len,
                "truncating torn trailing ledger frame"
            );
            file.set_len(loaded.committed_len)?;
            file.sync_data()?;
        }

        let algorithm = options.algorithm;
        let sealed = match &loaded.unreadable {
            Some(frame) => {
                let previous = loaded.entries.last().map_or(Digest::ZERO, |e| e.digest);
                error!(
                    sequence = frame.sequence,
                    offset = frame.offset,
                    "undecodable ledger frame; appends sealed"
                );
                Some(VigilError::chain_break(frame.sequence, previous, Digest::ZERO))
            }
            None => first_chain_fault(&loaded.entries, algorithm),
        };
        if let Some(reason) = &sealed {
            error!(
                error = %reason,
                "ledger chain broken; appends sealed until repaired or escalated"
            );
        }

        let mut index = open_backend(options.index_backend, &paths.index)?;
        catch_up_index(index.as_mut(), &loaded.entries, &loaded.frames);

        let (mut merkle, node_problem) = load_node_log(&paths.merkle_nodes, algorithm)?;
        let (mut merkle_state, state_problem) = load_state(&paths.merkle_state)?;
        let merkle_problems: Vec<String> = node_problem.into_iter().chain(state_problem).collect();
        if merkle_problems.is_empty() {
            catch_up_merkle(&options, &mut merkle, &mut merkle_state, &loaded.entries);
        }

        info!(
            path = %paths.ledger.display(),
            entries = loaded.entries.len(),
            algorithm = %algorithm,
            sealed = sealed.is_some(),
            "ledger opened"
        );

        Ok(Self {
            clock,
            writer: Mutex::new(WriterState {
                file,
                end_offset: loaded.committed_len,
                sealed,
            }),
            committed: RwLock::new(CommittedState {
                entries: Arc::new(loaded.entries),
                frames: Arc::new(loaded.frames),
                merkle: Arc::new(merkle),
                merkle_state,
                merkle_problems,
                index,
                unreadable: loaded.unreadable,
            }),
            options,
        })
    }

    /// Append a payload, authorized by a consumed governance grant
    pub fn append<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        signer: &dyn Signer,
        grant: ConsumedGrant,
    ) -> Result<LedgerEntry> {
        let payload = CanonicalPayload::from_serializable(payload)?;
        let mut writer = self.writer.lock();
        self.append_locked(&mut writer, payload, signer, grant)
    }

    /// Append, then run `after` on the committed entry before the writer
    /// lock is released
    ///
    /// No other append can land between the entry and `after`. An error from
    /// `after` leaves the entry committed.
    pub fn append_then<T, R, F>(
        &self,
        payload: &T,
        signer: &dyn Signer,
        grant: ConsumedGrant,
        after: F,
    ) -> Result<(LedgerEntry, R)>
    where
        T: Serialize + ?Sized,
        F: FnOnce(&LedgerEntry) -> Result<R>,
    {
        let payload = CanonicalPayload::from_serializable(payload)?;
        let mut writer = self.writer.lock();
        let entry = self.append_locked(&mut writer, payload, signer, grant)?;
        let value = after(&entry)?;
        Ok((entry, value))
    }

    fn append_locked(
        &self,
        writer: &mut WriterState,
        payload: CanonicalPayload,
        signer: &dyn Signer,
        grant: ConsumedGrant,
    ) -> Result<LedgerEntry> {
        if let Some(reason) = &writer.sealed {
            return Err(reason.clone());
        }

        let (sequence, previous_digest, last_timestamp) = {
            let committed = self.committed.read();
            let last = committed.entries.last();
            (
                committed.entries.len() as u64,
                last.map_or(Digest::ZERO, |e| e.digest),
                last.map(|e| e.timestamp),
            )
        };

        let now = self.clock.now();
        let timestamp = match last_timestamp {
            Some(last) if now < last => last,
            _ => now,
        };
        let key_id = signer.key_id();
        let digest = compute_entry_digest(
            self.options.algorithm,
            &previous_digest,
            payload.as_bytes(),
            &timestamp,
            &key_id,
        );
        let signature = signer.sign_digest(&digest)?;
        let entry = LedgerEntry {
            sequence,
            timestamp,
            payload,
            previous_digest,
            digest,
            key_id,
            signature,
        };
        let frame = entry.to_frame()?;

        let offset = writer.end_offset;
        let written = writer
            .file
            .write_all(&frame)
            .and_then(|()| writer.file.sync_data());
        if let Err(e) = written {
            error!(sequence, error = %e, "ledger write failed; restoring tail");
            if writer.file.set_len(offset).is_err() {
                writer.sealed = Some(VigilError::storage(format!(
                    "ledger tail could not be restored after failed append at sequence {sequence}"
                )));
            }
            return Err(VigilError::storage(format!(
                "append failed at sequence {sequence}: {e}"
            )));
        }
        writer.end_offset += frame.len() as u64;

        let location = FrameLocation {
            offset,
            length: frame.len() as u64,
        };
        self.commit(&entry, location);
        info!(
            sequence,
            digest = %entry.digest.short(),
            key_id = %entry.key_id,
            nonce = %grant.nonce(),
            scope = %grant.scope(),
            "ledger entry appended"
        );
        Ok(entry)
    }

    fn commit(&self, entry: &LedgerEntry, location: FrameLocation) {
        let mut committed = self.committed.write();
        Arc::make_mut(&mut committed.entries).push(entry.clone());
        Arc::make_mut(&mut committed.frames).push(location);
        let nodes = Arc::make_mut(&mut committed.merkle).append_entry(&entry.digest);

        if committed.merkle_problems.is_empty() {
            let state = committed.merkle.state();
            let persisted = append_node_log(&self.options.paths.merkle_nodes, &nodes)
                .and_then(|()| write_state(&self.options.paths.merkle_state, &state));
            match persisted {
                Ok(()) => committed.merkle_state = Some(state),
                Err(e) => warn!(
                    sequence = entry.sequence,
                    error = %e,
                    "merkle state not persisted; divergence scan will report the lag"
                ),
            }
        } else {
            debug!(
                sequence = entry.sequence,
                "persisted merkle state is damaged; leaving it for repair"
            );
        }

        if let Err(e) = committed
            .index
            .put(IndexRecord::for_entry(entry, location))
        {
            warn!(sequence = entry.sequence, error = %e, "index record not persisted");
        }
    }

    /// Entry at `sequence`
    pub fn read(&self, sequence: Sequence) -> Result<LedgerEntry> {
        let committed = self.committed.read();
        usize::try_from(sequence)
            .ok()
            .and_then(|i| committed.entries.get(i))
            .cloned()
            .ok_or_else(|| VigilError::not_found(format!("no entry at sequence {sequence}")))
    }

    /// Entries within `range`, in order
    pub fn scan(&self, range: impl RangeBounds<Sequence>) -> Vec<LedgerEntry> {
        let committed = self.committed.read();
        committed
            .entries
            .iter()
            .filter(|e| range.contains(&e.sequence))
            .cloned()
            .collect()
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.committed.read().entries.len()
    }

    /// Whether no entry has been committed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last committed entry
    pub fn head(&self) -> Option<LedgerEntry> {
        self.committed.read().entries.last().cloned()
    }

    /// Current Merkle root
    pub fn merkle_root(&self) -> Digest {
        self.committed.read().merkle.root()
    }

    /// Index lookup
    pub fn lookup(&self, key: IndexKey) -> Result<IndexRecord> {
        self.committed
            .read()
            .index
            .lookup(key)
            .ok_or_else(|| VigilError::not_found(format!("index has no record for {key:?}")))
    }

    /// Read an entry from disk through the index
    pub fn read_indexed(&self, key: IndexKey) -> Result<LedgerEntry> {
        let record = self.lookup(key)?;
        let entry = self.read_frame(record.location())?;
        if entry.sequence != record.sequence || entry.digest != record.digest {
            return Err(VigilError::invalid(format!(
                "index record for sequence {} points at sequence {}",
                record.sequence, entry.sequence
            )));
        }
        Ok(entry)
    }

    /// Decode the frame at a location in the ledger file
    pub fn read_frame(&self, location: FrameLocation) -> Result<LedgerEntry> {
        let mut file = File::open(&self.options.paths.ledger)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let length = usize::try_from(location.length)
            .map_err(|_| VigilError::invalid("frame length exceeds address space"))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)?;
        LedgerEntry::from_frame(&buf)
    }

    /// Point-in-time view for verification jobs
    pub fn snapshot(&self) -> LedgerSnapshot {
        let committed = self.committed.read();
        LedgerSnapshot {
            algorithm: self.options.algorithm,
            entries: Arc::clone(&committed.entries),
            frames: Arc::clone(&committed.frames),
            merkle: Arc::clone(&committed.merkle),
            merkle_state: committed.merkle_state.clone(),
            merkle_problems: committed.merkle_problems.clone(),
            index: committed.index.records(),
            unreadable: committed.unreadable.clone(),
        }
    }

    /// Why appends are refused, if they are
    pub fn sealed(&self) -> Option<VigilError> {
        self.writer.lock().sealed.clone()
    }

    /// Replace Merkle and index state with a rebuild
    ///
    /// Entries committed after the rebuild was computed are folded in under
    /// the writer lock, so the installed state covers the whole ledger.
    pub fn install_derived(&self, mut rebuilt: DerivedState) -> Result<DerivedInstall> {
        let _writer = self.writer.lock();
        let mut committed = self.committed.write();

        let covered = rebuilt.merkle.leaf_count();
        let total = committed.entries.len() as u64;
        if covered > total || rebuilt.records.len() as u64 > total {
            return Err(VigilError::invalid(format!(
                "rebuilt state covers {covered} entries but the ledger holds {total}"
            )));
        }
        for (entry, location) in committed
            .entries
            .iter()
            .zip(committed.frames.iter())
            .skip(covered as usize)
        {
            rebuilt.merkle.append_entry(&entry.digest);
            rebuilt.records.push(IndexRecord::for_entry(entry, *location));
        }

        let state = rebuilt.merkle.state();
        rewrite_node_log(&self.options.paths.merkle_nodes, &rebuilt.merkle)?;
        write_state(&self.options.paths.merkle_state, &state)?;
        let index_records = rebuilt.records.len() as u64;
        committed.index.rebuild(rebuilt.records)?;

        committed.merkle = Arc::new(rebuilt.merkle);
        committed.merkle_state = Some(state);
        committed.merkle_problems.clear();

        info!(
            caught_up = total - covered,
            leaf_count = total,
            index_records,
            "derived state replaced"
        );
        Ok(DerivedInstall {
            caught_up: total - covered,
            leaf_count: total,
            index_records,
        })
    }

    /// Construction options
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Digest algorithm
    pub fn algorithm(&self) -> HashAlgorithmId {
        self.options.algorithm
    }

    /// Clock used for entry timestamps
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("options", &self.options)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn catch_up_index(index: &mut dyn IndexBackend, entries: &[LedgerEntry], frames: &[FrameLocation]) {
    if index.kind() == IndexBackendKind::Memory {
        if let Err(e) = index.rebuild(records_from_ledger(entries, frames)) {
            warn!(error = %e, "memory index rebuild failed");
        }
        return;
    }
    let have = index.len();
    let is_prefix = have == 0 || index.get(have as u64 - 1).is_some();
    if have >= entries.len() || !is_prefix {
        return;
    }
    for (entry, location) in entries.iter().zip(frames).skip(have) {
        if let Err(e) = index.put(IndexRecord::for_entry(entry, *location)) {
            warn!(sequence = entry.sequence, error = %e, "index catch-up stopped");
            return;
        }
    }
    info!(records = entries.len() - have, "index caught up with ledger");
}

fn catch_up_merkle(
    options: &StoreOptions,
    merkle: &mut MerkleAccumulator,
    merkle_state: &mut Option<MerkleStateFile>,
    entries: &[LedgerEntry],
) {
    let leaves = merkle.leaf_count();
    if leaves >= entries.len() as u64 {
        return;
    }
    let consistent = match merkle_state {
        Some(state) => state.leaf_count == leaves && state.root == merkle.root(),
        None => leaves == 0,
    };
    if !consistent {
        warn!(leaves, "merkle files disagree with each other; not catching up");
        return;
    }
    let mut nodes = Vec::new();
    for entry in entries.iter().skip(leaves as usize) {
        nodes.extend(merkle.append_entry(&entry.digest));
    }
    let state = merkle.state();
    let persisted = append_node_log(&options.paths.merkle_nodes, &nodes)
        .and_then(|()| write_state(&options.paths.merkle_state, &state));
    match persisted {
        Ok(()) => {
            info!(
                leaves = entries.len() as u64 - leaves,
                "merkle accumulator caught up with ledger"
            );
            *merkle_state = Some(state);
        }
        Err(e) => warn!(error = %e, "merkle catch-up not persisted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use vigil_core::{EntrySignature, KeyId, ManualClock};
    use vigil_guards::{TokenGuard, TokenScope};

    pub(crate) struct EchoSigner;

    impl Signer for EchoSigner {
        fn key_id(&self) -> KeyId {
            KeyId::new("key-echo")
        }

        fn sign_digest(&self, digest: &Digest) -> Result<EntrySignature> {
            let mut sig = [0u8; 64];
            sig[..32].copy_from_slice(digest.as_bytes());
            sig[32..].copy_from_slice(digest.as_bytes());
            Ok(EntrySignature(sig))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        options: StoreOptions,
        clock: Arc<ManualClock>,
        guard: TokenGuard,
    }

    impl Fixture {
        fn new(backend: IndexBackendKind) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let options = StoreOptions {
                paths: DataPaths::new(dir.path()),
                algorithm: HashAlgorithmId::Sha256,
                index_backend: backend,
            };
            Self {
                _dir: dir,
                options,
                clock: Arc::new(ManualClock::at_epoch()),
                guard: TokenGuard::in_memory(HashAlgorithmId::Sha256, 1024),
            }
        }

        fn open(&self) -> LedgerStore {
            LedgerStore::open(self.options.clone(), self.clock.clone()).unwrap()
        }

        fn grant(&self) -> ConsumedGrant {
            let now = self.clock.now();
            let token = self
                .guard
                .issue(60, [TokenScope::Append], Vec::new(), now)
                .unwrap();
            self.guard.consume(&token, TokenScope::Append, 0, now).unwrap()
        }
    }

    #[test]
    fn test_append_then_read_roundtrip() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        let entry = store
            .append(&json!({"a": 1}), &EchoSigner, fx.grant())
            .unwrap();
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.previous_digest, Digest::ZERO);

        let read = store.read(0).unwrap();
        assert_eq!(read.payload.as_bytes(), entry.payload.as_bytes());
        assert_eq!(read.digest, entry.digest);
        assert_eq!(store.read_indexed(IndexKey::Sequence(0)).unwrap(), entry);
        assert_eq!(store.read_indexed(IndexKey::Digest(entry.digest)).unwrap(), entry);
    }

    #[test]
    fn test_chain_links_and_reopen() {
        let fx = Fixture::new(IndexBackendKind::File);
        let root = {
            let store = fx.open();
            for i in 0..5 {
                fx.clock.advance_millis(1);
                store.append(&json!({"i": i}), &EchoSigner, fx.grant()).unwrap();
            }
            let entries = store.scan(..);
            for pair in entries.windows(2) {
                assert_eq!(pair[1].previous_digest, pair[0].digest);
            }
            store.merkle_root()
        };
        let reopened = fx.open();
        assert_eq!(reopened.len(), 5);
        assert_eq!(reopened.merkle_root(), root);
        assert!(reopened.sealed().is_none());
        assert_eq!(reopened.scan(1..3).len(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let fx = Fixture::new(IndexBackendKind::File);
        {
            let store = fx.open();
            store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
        }
        let clean_len = fs::metadata(&fx.options.paths.ledger).unwrap().len();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&fx.options.paths.ledger)
            .unwrap();
        file.write_all(br#"{"digest":"ab"#).unwrap();
        drop(file);

        let store = fx.open();
        assert_eq!(store.len(), 1);
        assert_eq!(
            fs::metadata(&fx.options.paths.ledger).unwrap().len(),
            clean_len
        );
        let next = store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();
        assert_eq!(next.sequence, 1);
    }

    #[test]
    fn test_broken_chain_seals_appends() {
        let fx = Fixture::new(IndexBackendKind::File);
        {
            let store = fx.open();
            for payload in [json!({"a": 1}), json!({"b": 2}), json!({"c": 3})] {
                store.append(&payload, &EchoSigner, fx.grant()).unwrap();
            }
        }
        let text = fs::read_to_string(&fx.options.paths.ledger).unwrap();
        fs::write(&fx.options.paths.ledger, text.replace(r#"{"b":2}"#, r#"{"b":9}"#)).unwrap();

        let store = fx.open();
        assert_matches!(store.sealed(), Some(VigilError::ChainBreak { sequence: 1, .. }));
        let err = store
            .append(&json!({"d": 4}), &EchoSigner, fx.grant())
            .unwrap_err();
        assert!(err.is_integrity_failure());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_memory_index_rebuilt_on_open() {
        let fx = Fixture::new(IndexBackendKind::Memory);
        {
            let store = fx.open();
            store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
            store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();
        }
        let store = fx.open();
        assert_eq!(store.lookup(IndexKey::Sequence(1)).unwrap().sequence, 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_appends() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
        let snapshot = store.snapshot();
        store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.merkle.leaf_count(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_timestamps_never_regress() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        fx.clock.advance_secs(10);
        let first = store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
        fx.clock.set(ManualClock::at_epoch().now());
        let second = store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn test_lagging_merkle_is_caught_up_on_open() {
        let fx = Fixture::new(IndexBackendKind::File);
        let root = {
            let store = fx.open();
            store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
            store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();
            store.merkle_root()
        };
        fs::remove_file(&fx.options.paths.merkle_nodes).unwrap();
        fs::remove_file(&fx.options.paths.merkle_state).unwrap();
        let store = fx.open();
        assert_eq!(store.merkle_root(), root);
        assert_eq!(store.snapshot().merkle_state.unwrap().root, root);
    }

    #[test]
    fn test_install_derived_catches_up_new_entries() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        store.append(&json!({"a": 1}), &EchoSigner, fx.grant()).unwrap();
        let snapshot = store.snapshot();
        let rebuilt = DerivedState {
            merkle: MerkleAccumulator::from_entry_digests(
                snapshot.algorithm,
                snapshot.entries.iter().map(|e| &e.digest),
            ),
            records: records_from_ledger(&snapshot.entries, &snapshot.frames),
        };
        store.append(&json!({"b": 2}), &EchoSigner, fx.grant()).unwrap();

        let installed = store.install_derived(rebuilt).unwrap();
        assert_eq!(installed.caught_up, 1);
        assert_eq!(installed.leaf_count, 2);
        assert_eq!(store.lookup(IndexKey::Sequence(1)).unwrap().sequence, 1);
    }

    #[test]
    fn test_unknown_sequence_is_not_found() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        assert_eq!(
            store.read(3).unwrap_err().kind(),
            vigil_core::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_serialization_error_leaves_ledger_untouched() {
        let fx = Fixture::new(IndexBackendKind::File);
        let store = fx.open();
        let err = store
            .append(&vec![f64::NAN], &EchoSigner, fx.grant())
            .unwrap_err();
        assert_eq!(err.kind(), vigil_core::ErrorKind::Serialization);
        assert!(store.is_empty());
    }
}
