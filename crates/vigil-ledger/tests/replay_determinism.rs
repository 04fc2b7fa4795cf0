//! Replaying the ledger from sequence zero reproduces the incrementally
//! maintained Merkle root, before and after a restart.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use vigil_core::{
    Clock, DataPaths, Digest, EntrySignature, HashAlgorithmId, IndexBackendKind, KeyId,
    ManualClock, Result, Signer,
};
use vigil_guards::{TokenGuard, TokenScope};
use vigil_ledger::{IndexKey, LedgerStore, MerkleAccumulator, StoreOptions};

struct FixedSigner;

impl Signer for FixedSigner {
    fn key_id(&self) -> KeyId {
        KeyId::new("key-fixed")
    }

    fn sign_digest(&self, digest: &Digest) -> Result<EntrySignature> {
        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(digest.as_bytes());
        Ok(EntrySignature(sig))
    }
}

fn payload_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        any::<i64>().prop_map(|n| json!({ "n": n })),
        "[a-z]{0,12}".prop_map(|s| json!({ "s": s, "tags": ["x", s.len()] })),
        (any::<bool>(), -1.0e6f64..1.0e6).prop_map(|(b, f)| json!({ "b": b, "f": f })),
    ]
}

fn run(algorithm: HashAlgorithmId, payloads: Vec<serde_json::Value>) {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions {
        paths: DataPaths::new(dir.path()),
        algorithm,
        index_backend: IndexBackendKind::File,
    };
    let clock = Arc::new(ManualClock::at_epoch());
    let guard = TokenGuard::in_memory(algorithm, 4096);

    let incremental = {
        let store = LedgerStore::open(options.clone(), clock.clone()).unwrap();
        for payload in &payloads {
            clock.advance_millis(7);
            let token = guard
                .issue(60, [TokenScope::Append], Vec::new(), clock.now())
                .unwrap();
            let grant = guard
                .consume(&token, TokenScope::Append, 0, clock.now())
                .unwrap();
            store.append(payload, &FixedSigner, grant).unwrap();
        }
        store.merkle_root()
    };

    let store = LedgerStore::open(options, clock).unwrap();
    let entries = store.scan(..);
    assert_eq!(entries.len(), payloads.len());
    let recomputed: Vec<Digest> = entries.iter().map(|e| e.recompute_digest(algorithm)).collect();
    let replayed = MerkleAccumulator::from_entry_digests(algorithm, &recomputed);

    assert_eq!(replayed.root(), incremental);
    assert_eq!(store.merkle_root(), incremental);
    for entry in &entries {
        let via_index = store.read_indexed(IndexKey::Sequence(entry.sequence)).unwrap();
        assert_eq!(&via_index, entry);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn replay_matches_incremental_root_sha256(
        payloads in proptest::collection::vec(payload_strategy(), 0..24),
    ) {
        run(HashAlgorithmId::Sha256, payloads);
    }

    #[test]
    fn replay_matches_incremental_root_blake3(
        payloads in proptest::collection::vec(payload_strategy(), 0..24),
    ) {
        run(HashAlgorithmId::Blake3, payloads);
    }
}
