//! Entries signed before a rotation keep verifying after it, across a
//! process restart, through the rotation lineage.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::json;
use std::sync::Arc;
use vigil_core::{
    Clock, DataPaths, HashAlgorithmId, IndexBackendKind, ManualClock, SignatureVerifier,
};
use vigil_guards::{TokenGuard, TokenScope};
use vigil_ledger::{LedgerStore, StoreOptions};
use vigil_signature::{KeyManager, KeyStatus, RotationReceipt, ROTATION_RECORD};

#[test]
fn pre_rotation_signatures_verify_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let algorithm = HashAlgorithmId::Blake3;
    let options = StoreOptions {
        paths: DataPaths::new(dir.path()),
        algorithm,
        index_backend: IndexBackendKind::File,
    };
    let clock = Arc::new(ManualClock::at_epoch());
    let guard = TokenGuard::open(&options.paths.token_state, algorithm, 128).unwrap();
    let key_dir = options.paths.keys.clone();

    {
        let store = LedgerStore::open(options.clone(), clock.clone()).unwrap();
        let keys = KeyManager::open_with_rng(
            &key_dir,
            algorithm,
            60,
            clock.now(),
            ChaCha20Rng::seed_from_u64(11),
        )
        .unwrap();

        for round in 0..3 {
            for n in 0..2 {
                let token = guard
                    .issue(30, [TokenScope::Append], Vec::new(), clock.now())
                    .unwrap();
                let grant = guard
                    .consume(&token, TokenScope::Append, 0, clock.now())
                    .unwrap();
                store
                    .append(&json!({ "round": round, "n": n }), &keys, grant)
                    .unwrap();
            }
            clock.advance_secs(61);
            let token = guard
                .issue(
                    30,
                    [TokenScope::RotateKey],
                    ["alice".to_owned(), "bob".to_owned()],
                    clock.now(),
                )
                .unwrap();
            keys.rotate(&store, &guard, &token, 2, "scheduled", clock.now())
                .unwrap();
        }
        assert_eq!(keys.lineage().keys.len(), 4);
    }

    let store = LedgerStore::open(options, clock.clone()).unwrap();
    let keys = KeyManager::open(&key_dir, algorithm, 60, clock.now()).unwrap();
    assert_eq!(keys.reconcile(&store.scan(..)).unwrap(), 0);

    let lineage = keys.lineage();
    let statuses: Vec<KeyStatus> = lineage.keys.iter().map(|k| k.status).collect();
    assert_eq!(
        statuses,
        [
            KeyStatus::Retired,
            KeyStatus::Retired,
            KeyStatus::Retired,
            KeyStatus::Active
        ]
    );

    for entry in store.scan(..) {
        let verifier: &dyn SignatureVerifier = &keys;
        assert!(verifier
            .verify_at(&entry.digest, &entry.signature, &entry.key_id, entry.sequence)
            .unwrap());
        if entry.payload.record_type() == Some(ROTATION_RECORD) {
            let receipt: RotationReceipt = entry.payload.decode().unwrap();
            receipt.verify(algorithm).unwrap();
            assert_eq!(receipt.body.previous_key_id, entry.key_id);
        }
    }
}
