//! Derived index: sequence or digest to frame location
//!
//! The index is never authoritative. It can always be rebuilt from the ledger
//! file, and a rebuild simply replaces whatever the backend held.

use crate::entry::{FrameLocation, LedgerEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_core::persist::{read_optional, write_atomic};
use vigil_core::{codec, Digest, IndexBackendKind, Result, Sequence};

/// Locator for one ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Entry sequence
    pub sequence: Sequence,
    /// Entry digest as stored in the frame
    pub digest: Digest,
    /// Byte offset of the frame in the ledger file
    pub offset: u64,
    /// Frame length including its newline
    pub length: u64,
}

impl IndexRecord {
    /// Record for an entry at a known location
    pub fn for_entry(entry: &LedgerEntry, location: FrameLocation) -> Self {
        Self {
            sequence: entry.sequence,
            digest: entry.digest,
            offset: location.offset,
            length: location.length,
        }
    }

    /// Frame location
    pub fn location(&self) -> FrameLocation {
        FrameLocation {
            offset: self.offset,
            length: self.length,
        }
    }
}

/// Lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    /// By position
    Sequence(Sequence),
    /// By entry digest
    Digest(Digest),
}

/// Index records implied by the ledger contents
pub fn records_from_ledger(entries: &[LedgerEntry], frames: &[FrameLocation]) -> Vec<IndexRecord> {
    entries
        .iter()
        .zip(frames)
        .map(|(entry, location)| IndexRecord::for_entry(entry, *location))
        .collect()
}

/// Pluggable key-to-offset store
pub trait IndexBackend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> IndexBackendKind;

    /// Record for a sequence
    fn get(&self, sequence: Sequence) -> Option<IndexRecord>;

    /// Record for an entry digest
    fn find_digest(&self, digest: &Digest) -> Option<IndexRecord>;

    /// Insert or overwrite one record
    fn put(&mut self, record: IndexRecord) -> Result<()>;

    /// Replace every record
    fn rebuild(&mut self, records: Vec<IndexRecord>) -> Result<()>;

    /// All records in sequence order
    fn records(&self) -> Vec<IndexRecord>;

    /// Number of records
    fn len(&self) -> usize;

    /// Whether the index holds nothing
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a lookup key
    fn lookup(&self, key: IndexKey) -> Option<IndexRecord> {
        match key {
            IndexKey::Sequence(sequence) => self.get(sequence),
            IndexKey::Digest(digest) => self.find_digest(&digest),
        }
    }
}

/// In-process index
#[derive(Debug, Default, Clone)]
pub struct MemoryIndex {
    by_sequence: BTreeMap<Sequence, IndexRecord>,
    by_digest: HashMap<Digest, Sequence>,
}

impl MemoryIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, record: IndexRecord) {
        if let Some(previous) = self.by_sequence.insert(record.sequence, record) {
            if self.by_digest.get(&previous.digest) == Some(&previous.sequence) {
                self.by_digest.remove(&previous.digest);
            }
        }
        self.by_digest.insert(record.digest, record.sequence);
    }
}

impl IndexBackend for MemoryIndex {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::Memory
    }

    fn get(&self, sequence: Sequence) -> Option<IndexRecord> {
        self.by_sequence.get(&sequence).copied()
    }

    fn find_digest(&self, digest: &Digest) -> Option<IndexRecord> {
        self.by_digest
            .get(digest)
            .and_then(|sequence| self.by_sequence.get(sequence))
            .copied()
    }

    fn put(&mut self, record: IndexRecord) -> Result<()> {
        self.insert(record);
        Ok(())
    }

    fn rebuild(&mut self, records: Vec<IndexRecord>) -> Result<()> {
        self.by_sequence.clear();
        self.by_digest.clear();
        for record in records {
            self.insert(record);
        }
        Ok(())
    }

    fn records(&self) -> Vec<IndexRecord> {
        self.by_sequence.values().copied().collect()
    }

    fn len(&self) -> usize {
        self.by_sequence.len()
    }
}

/// Index persisted as one canonical JSON record per line
///
/// Later lines for the same sequence overwrite earlier ones.
#[derive(Debug)]
pub struct FileIndex {
    path: PathBuf,
    memory: MemoryIndex,
}

impl FileIndex {
    /// Load `path`, tolerating a missing file and skipping unreadable lines
    pub fn open(path: &Path) -> Result<Self> {
        let mut memory = MemoryIndex::new();
        if let Some(bytes) = read_optional(path)? {
            let mut skipped = 0usize;
            for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                match codec::decode::<IndexRecord>(line) {
                    Ok(record) => memory.insert(record),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(path = %path.display(), skipped, "unreadable index lines ignored");
            }
        }
        debug!(path = %path.display(), records = memory.len(), "file index loaded");
        Ok(Self {
            path: path.to_path_buf(),
            memory,
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IndexBackend for FileIndex {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::File
    }

    fn get(&self, sequence: Sequence) -> Option<IndexRecord> {
        self.memory.get(sequence)
    }

    fn find_digest(&self, digest: &Digest) -> Option<IndexRecord> {
        self.memory.find_digest(digest)
    }

    fn put(&mut self, record: IndexRecord) -> Result<()> {
        let mut line = codec::encode(&record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        self.memory.insert(record);
        Ok(())
    }

    fn rebuild(&mut self, records: Vec<IndexRecord>) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * 160);
        for record in &records {
            buf.extend_from_slice(&codec::encode(record)?);
            buf.push(b'\n');
        }
        write_atomic(&self.path, &buf)?;
        self.memory.rebuild(records)
    }

    fn records(&self) -> Vec<IndexRecord> {
        self.memory.records()
    }

    fn len(&self) -> usize {
        self.memory.len()
    }
}

/// Construct the configured backend
pub fn open_backend(kind: IndexBackendKind, path: &Path) -> Result<Box<dyn IndexBackend>> {
    Ok(match kind {
        IndexBackendKind::File => Box::new(FileIndex::open(path)?),
        IndexBackendKind::Memory => Box::new(MemoryIndex::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::HashAlgorithmId;

    fn record(sequence: u64) -> IndexRecord {
        IndexRecord {
            sequence,
            digest: HashAlgorithmId::Sha256.hash(&sequence.to_be_bytes()),
            offset: sequence * 100,
            length: 100,
        }
    }

    #[test]
    fn test_memory_lookup_by_both_keys() {
        let mut index = MemoryIndex::new();
        for i in 0..5 {
            index.put(record(i)).unwrap();
        }
        let wanted = record(3);
        assert_eq!(index.lookup(IndexKey::Sequence(3)), Some(wanted));
        assert_eq!(index.lookup(IndexKey::Digest(wanted.digest)), Some(wanted));
        assert_eq!(index.lookup(IndexKey::Sequence(9)), None);
    }

    #[test]
    fn test_overwrite_drops_stale_digest() {
        let mut index = MemoryIndex::new();
        let old = record(1);
        index.put(old).unwrap();
        let mut replacement = record(1);
        replacement.digest = Digest::ZERO;
        index.put(replacement).unwrap();
        assert_eq!(index.find_digest(&old.digest), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_file_index_persists_and_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        {
            let mut index = FileIndex::open(&path).unwrap();
            for i in 0..3 {
                index.put(record(i)).unwrap();
            }
        }
        let mut index = FileIndex::open(&path).unwrap();
        assert_eq!(index.records(), vec![record(0), record(1), record(2)]);

        index.rebuild(vec![record(7)]).unwrap();
        let reopened = FileIndex::open(&path).unwrap();
        assert_eq!(reopened.records(), vec![record(7)]);
    }

    #[test]
    fn test_file_index_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        let mut text = String::from_utf8(codec::encode(&record(0)).unwrap()).unwrap();
        text.push_str("\ngarbage\n");
        std::fs::write(&path, text).unwrap();
        let index = FileIndex::open(&path).unwrap();
        assert_eq!(index.len(), 1);
    }
}
