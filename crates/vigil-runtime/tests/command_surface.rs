//! Every command through one `LedgerContext`, checked on its report.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use vigil_core::{codec, Clock, Digest, ErrorKind, ManualClock, NeverCancel, VigilConfig};
use vigil_governance::{
    ActionDescriptor, ActivatedPolicy, ActivationMode, DecisionContext, PolicyRule, PolicyVersion,
    PublishedPolicy, QuorumPolicy, RuleEffect, Vote,
};
use vigil_guards::TokenScope;
use vigil_runtime::{CommandReport, DecisionOutcome, DecisionRequest, LedgerContext, LedgerStatus};
use vigil_signature::KeyManager;
use vigil_verify::{load_bundle, DivergenceReport, RootCause};

struct Fixture {
    dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            clock: Arc::new(ManualClock::at_epoch()),
        }
    }

    fn config(&self) -> VigilConfig {
        VigilConfig::with_data_dir(self.dir.path().join("data"))
    }

    /// First open generates the signing key from a fixed seed
    fn create(&self) -> LedgerContext {
        let config = self.config();
        let keys = KeyManager::open_with_rng(
            &config.paths().keys,
            config.hash_algorithm,
            config.keys.min_rotation_interval_secs,
            self.clock.now(),
            ChaCha20Rng::seed_from_u64(8),
        )
        .unwrap();
        LedgerContext::with_keys(config, self.clock.clone(), keys).unwrap()
    }

    /// Later opens load everything from disk
    fn reopen(&self) -> LedgerContext {
        LedgerContext::open(self.config(), self.clock.clone()).unwrap()
    }
}

fn token(ctx: &LedgerContext, scopes: &[TokenScope], approvals: &[&str]) -> String {
    let approvals: Vec<String> = approvals.iter().map(|a| (*a).to_owned()).collect();
    let report = ctx.issue_token(scopes, &approvals, None);
    assert!(report.success, "{report:?}");
    report.data["token"].as_str().unwrap().to_owned()
}

fn append(ctx: &LedgerContext, payload: Value) -> CommandReport {
    let token = token(ctx, &[TokenScope::Append], &[]);
    ctx.append(&payload, Some(&token))
}

fn data<T: serde::de::DeserializeOwned>(report: &CommandReport) -> T {
    serde_json::from_value(report.data.clone()).unwrap()
}

fn policy(label: &str, predecessor: Option<Digest>, default_effect: RuleEffect) -> PolicyVersion {
    PolicyVersion {
        label: label.to_owned(),
        predecessor,
        rules: vec![PolicyRule {
            id: "prod-deploy".to_owned(),
            action: "deploy".to_owned(),
            context_equals: [("env".to_owned(), json!("prod"))].into_iter().collect(),
            effect: RuleEffect::RequireQuorum { threshold: None },
        }],
        quorum: QuorumPolicy {
            threshold: 2,
            approvers: ["alice", "bob", "carol"].iter().map(|s| (*s).to_owned()).collect(),
        },
        default_effect,
    }
}

fn prod() -> DecisionContext {
    [("env".to_owned(), json!("prod"))].into_iter().collect()
}

fn replace_in_file(path: &std::path::Path, from: &str, to: &str) {
    let text = fs::read_to_string(path).unwrap();
    assert_eq!(text.matches(from).count(), 1, "{from} must occur exactly once");
    fs::write(path, text.replace(from, to)).unwrap();
}

#[test]
fn append_without_a_token_is_refused_and_nothing_is_written() {
    let fx = Fixture::new();
    let ctx = fx.create();

    let report = ctx.append(&json!({"note": "alpha"}), None);
    assert!(!report.success);
    assert_eq!(report.error_kind(), Some(ErrorKind::GovernanceToken));
    assert_eq!(report.error.as_ref().unwrap().details["cause"], "missing");

    let report = ctx.append(&json!({"note": "alpha"}), Some("not-a-token"));
    assert_eq!(report.error.as_ref().unwrap().details["cause"], "malformed");
    assert_eq!(ctx.store().len(), 0);
}

#[test]
fn a_token_is_good_for_exactly_one_append() {
    let fx = Fixture::new();
    let ctx = fx.create();
    let token = token(&ctx, &[TokenScope::Append], &[]);

    let first = ctx.append(&json!({"note": "alpha"}), Some(&token));
    assert!(first.success, "{first:?}");
    assert_eq!(first.data["sequence"], 0);
    assert_eq!(first.data["merkle_root"], json!(ctx.store().merkle_root()));

    let replay = ctx.append(&json!({"note": "beta"}), Some(&token));
    assert!(!replay.success);
    assert_eq!(replay.error.as_ref().unwrap().details["cause"], "replayed");
    assert_eq!(ctx.store().len(), 1);
}

#[test]
fn consumed_nonces_survive_a_restart() {
    let fx = Fixture::new();
    let token = {
        let ctx = fx.create();
        let token = token(&ctx, &[TokenScope::Append], &[]);
        assert!(ctx.append(&json!({"note": "alpha"}), Some(&token)).success);
        token
    };

    let ctx = fx.reopen();
    assert_eq!(ctx.store().len(), 1);
    let report = ctx.append(&json!({"note": "beta"}), Some(&token));
    assert_eq!(report.error.as_ref().unwrap().details["cause"], "replayed");
    assert_eq!(ctx.store().len(), 1);
}

#[test]
fn wrong_scope_is_unauthorized() {
    let fx = Fixture::new();
    let ctx = fx.create();
    let publish_only = token(&ctx, &[TokenScope::Publish], &[]);
    let report = ctx.append(&json!({"note": "alpha"}), Some(&publish_only));
    assert_eq!(report.error_kind(), Some(ErrorKind::GovernanceToken));
    assert_eq!(report.error.as_ref().unwrap().details["cause"], "unauthorized");
}

#[test]
fn policy_lifecycle_through_the_command_surface() {
    let fx = Fixture::new();
    let ctx = fx.create();

    let dry_run = DecisionRequest {
        action: ActionDescriptor::new("deploy", "api"),
        context: prod(),
        votes: Vec::new(),
    };
    let report = ctx.evaluate_decision(dry_run.clone(), false, None);
    assert_eq!(report.error_kind(), Some(ErrorKind::PolicyVersion));

    let publish = ctx.publish_policy(
        policy("v1", None, RuleEffect::Approve),
        Some(&token(&ctx, &[TokenScope::Publish], &["alice"])),
    );
    assert!(publish.success, "{publish:?}");
    let v1: PublishedPolicy = data(&publish);
    let activate = ctx.activate_policy(
        v1.policy_hash,
        "initial",
        Some(&token(&ctx, &[TokenScope::Publish], &["alice"])),
    );
    assert!(activate.success, "{activate:?}");

    let evaluated = ctx.evaluate_decision(dry_run, false, None);
    let evaluated: DecisionOutcome = data(&evaluated);
    assert_eq!(evaluated.sequence, None);
    let len = ctx.store().len();

    let approved = ctx.evaluate_decision(
        DecisionRequest {
            action: ActionDescriptor::new("deploy", "api"),
            context: prod(),
            votes: vec![Vote::approve("alice"), Vote::approve("carol")],
        },
        true,
        Some(&token(&ctx, &[TokenScope::Append], &[])),
    );
    assert!(approved.success, "{approved:?}");
    let approved: DecisionOutcome = data(&approved);
    assert_eq!(approved.sequence, Some(len as u64));

    let v2 = ctx.publish_policy(
        policy("v2", Some(v1.policy_hash), RuleEffect::Defer),
        Some(&token(&ctx, &[TokenScope::Publish], &["alice"])),
    );
    let v2: PublishedPolicy = data(&v2);
    let activate_v2 = token(&ctx, &[TokenScope::Publish], &["alice"]);
    assert!(ctx
        .activate_policy(v2.policy_hash, "stricter", Some(&activate_v2))
        .success);

    let deferred = ctx.evaluate_decision(
        DecisionRequest {
            action: ActionDescriptor::new("restart", "db"),
            context: BTreeMap::new(),
            votes: Vec::new(),
        },
        true,
        Some(&token(&ctx, &[TokenScope::Append], &[])),
    );
    let deferred: DecisionOutcome = data(&deferred);

    let diff = ctx.diff_receipts(approved.sequence.unwrap(), deferred.sequence.unwrap());
    assert!(diff.success, "{diff:?}");
    let fields: Vec<&str> = diff.data["differences"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"body.verdict"));
    assert!(fields.contains(&"body.policy_hash"));

    let not_a_receipt = ctx.diff_receipts(0, deferred.sequence.unwrap());
    assert_eq!(not_a_receipt.error_kind(), Some(ErrorKind::Invalid));

    let wrong_scope = ctx.rollback_policy(
        v1.policy_hash,
        "too strict",
        Some(&token(&ctx, &[TokenScope::Publish], &["alice"])),
    );
    assert!(!wrong_scope.success);
    let rollback = ctx.rollback_policy(
        v1.policy_hash,
        "too strict",
        Some(&token(&ctx, &[TokenScope::Rollback], &["alice"])),
    );
    assert!(rollback.success, "{rollback:?}");
    let rollback: ActivatedPolicy = data(&rollback);
    assert_eq!(rollback.mode, ActivationMode::Rollback);
    assert_eq!(rollback.previous, Some(v2.policy_hash));

    let replay = ctx.governance_replay();
    assert!(replay.success);
    assert_eq!(replay.data["published_versions"], 2);
    assert_eq!(replay.data["chain_intact"], true);
    assert_eq!(replay.data["active_label"], "v1");
}

#[test]
fn divergence_scan_reports_a_tampered_entry() {
    let fx = Fixture::new();
    {
        let ctx = fx.create();
        for note in ["alpha", "bravo", "charlie"] {
            assert!(append(&ctx, json!({ "note": note })).success);
        }
        let clean = ctx.divergence_scan(&NeverCancel);
        assert!(clean.success, "{clean:?}");
    }

    replace_in_file(&fx.config().paths().ledger, "bravo", "brave");

    let ctx = fx.reopen();
    let report = ctx.divergence_scan(&NeverCancel);
    assert!(!report.success);
    assert_eq!(report.error_kind(), Some(ErrorKind::ChainBreak));
    let scan: DivergenceReport = data(&report);
    assert_eq!(scan.divergent_sequences(), vec![1]);
    assert_eq!(scan.root_cause, RootCause::LedgerCorruption);

    let refused = append(&ctx, json!({"note": "delta"}));
    assert_eq!(refused.error_kind(), Some(ErrorKind::ChainBreak));
    let repair = ctx.auto_repair(&NeverCancel);
    assert_eq!(repair.error_kind(), Some(ErrorKind::ChainBreak));
    assert_eq!(ctx.store().len(), 3);
}

#[test]
fn auto_repair_rebuilds_a_shifted_index() {
    let fx = Fixture::new();
    {
        let ctx = fx.create();
        for n in 0..4 {
            assert!(append(&ctx, json!({ "n": n })).success);
        }
    }
    let index = fx.config().paths().index;
    let mut lines: Vec<String> = fs::read_to_string(&index)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect();
    let mut record: vigil_ledger::IndexRecord = codec::decode(lines[2].as_bytes()).unwrap();
    record.offset += 1;
    lines[2] = String::from_utf8(codec::encode(&record).unwrap()).unwrap();
    fs::write(&index, lines.join("\n") + "\n").unwrap();

    let ctx = fx.reopen();
    assert_eq!(ctx.divergence_scan(&NeverCancel).error_kind(), Some(ErrorKind::Invalid));
    let repair = ctx.auto_repair(&NeverCancel);
    assert!(repair.success, "{repair:?}");
    assert_eq!(repair.data["entries_replayed"], 4);
    assert!(ctx.divergence_scan(&NeverCancel).success);
}

#[test]
fn parallel_replay_agrees_with_the_store() {
    let fx = Fixture::new();
    let ctx = fx.create();
    for n in 0..37 {
        assert!(append(&ctx, json!({ "n": n })).success);
    }
    let report = ctx.parallel_replay(Some(3), Some(5), &NeverCancel);
    assert!(report.success, "{report:?}");
    assert_eq!(report.data["entries"], 37);
    assert_eq!(report.data["matches_persisted"], true);
    assert_eq!(report.data["merkle_root"], json!(ctx.store().merkle_root()));
}

#[test]
fn reproducibility_audit_flags_drift_after_capture() {
    let fx = Fixture::new();
    let ctx = fx.create();
    assert!(append(&ctx, json!({"n": 0})).success);

    let reference = fx.dir.path().join("reference.json");
    assert!(ctx.capture_reference(&reference, None).success);
    let audit = ctx.reproducibility_audit(&reference, None);
    assert!(audit.success, "{audit:?}");

    assert!(append(&ctx, json!({"n": 1})).success);
    let audit = ctx.reproducibility_audit(&reference, None);
    assert!(!audit.success);
    assert_eq!(audit.error_kind(), Some(ErrorKind::Invalid));
    assert_eq!(audit.data["consistent"], false);

    let missing = ctx.reproducibility_audit(&fx.dir.path().join("nope.json"), None);
    assert_eq!(missing.error_kind(), Some(ErrorKind::NotFound));
}

#[test]
fn snapshot_restore_rolls_live_state_back_to_the_bundle() {
    let fx = Fixture::new();
    let ctx = fx.create();
    for n in 0..3 {
        assert!(append(&ctx, json!({ "n": n })).success);
    }
    let root = ctx.store().merkle_root();
    let bundle = fx.dir.path().join("bundles/three.json");
    let export = ctx.snapshot_export(&bundle);
    assert!(export.success, "{export:?}");
    assert_eq!(export.data["entries"], 3);

    for n in 3..5 {
        assert!(append(&ctx, json!({ "n": n })).success);
    }

    let no_token = ctx.snapshot_restore(&bundle, None, &NeverCancel);
    assert_eq!(no_token.error_kind(), Some(ErrorKind::GovernanceToken));
    assert_eq!(ctx.store().len(), 5);

    let restore = ctx.snapshot_restore(
        &bundle,
        Some(&token(&ctx, &[TokenScope::Repair], &["alice"])),
        &NeverCancel,
    );
    assert!(restore.success, "{restore:?}");
    assert_eq!(restore.data["accepted"], true);
    assert_eq!(ctx.store().len(), 3);
    assert_eq!(ctx.store().merkle_root(), root);

    assert!(append(&ctx, json!({"n": "after"})).success);
    assert!(ctx.divergence_scan(&NeverCancel).success);
}

#[test]
fn snapshot_with_a_forged_root_is_rejected() {
    let fx = Fixture::new();
    let ctx = fx.create();
    for n in 0..3 {
        assert!(append(&ctx, json!({ "n": n })).success);
    }
    let bundle = fx.dir.path().join("forged.json");
    assert!(ctx.snapshot_export(&bundle).success);
    let mut forged = load_bundle(&bundle).unwrap();
    forged.merkle_root = Digest([7; 32]);
    fs::write(&bundle, codec::encode(&forged).unwrap()).unwrap();
    assert!(append(&ctx, json!({"n": 3})).success);
    let root = ctx.store().merkle_root();

    let report = ctx.snapshot_restore(
        &bundle,
        Some(&token(&ctx, &[TokenScope::Repair], &["alice"])),
        &NeverCancel,
    );
    assert!(!report.success);
    assert_eq!(report.error_kind(), Some(ErrorKind::MerkleDivergence));
    assert_eq!(report.data["accepted"], false);
    assert_eq!(ctx.store().len(), 4);
    assert_eq!(ctx.store().merkle_root(), root);
    assert!(!fx.config().paths().root.join(vigil_verify::snapshot::STAGING_DIR).exists());
}

#[test]
fn restore_refuses_a_bundle_exported_before_a_key_rotation() {
    let fx = Fixture::new();
    let ctx = fx.create();
    for n in 0..3 {
        assert!(append(&ctx, json!({ "n": n })).success);
    }
    let bundle = fx.dir.path().join("before-rotation.json");
    assert!(ctx.snapshot_export(&bundle).success);

    fx.clock.advance_secs(ctx.config().keys.min_rotation_interval_secs + 1);
    let rotated = ctx.rotate_key(
        "scheduled",
        Some(&token(&ctx, &[TokenScope::RotateKey], &["alice", "bob"])),
    );
    assert!(rotated.success, "{rotated:?}");

    let restore = ctx.snapshot_restore(
        &bundle,
        Some(&token(&ctx, &[TokenScope::Repair], &["alice"])),
        &NeverCancel,
    );
    assert!(!restore.success);
    assert_eq!(restore.error_kind(), Some(ErrorKind::Invalid));
    assert_eq!(ctx.store().len(), 4);

    assert!(append(&ctx, json!({"n": "after"})).success);
    assert!(ctx.divergence_scan(&NeverCancel).success);
}

#[test]
fn rotation_changes_the_active_key_and_keeps_history_verifiable() {
    let fx = Fixture::new();
    let ctx = fx.create();
    assert!(append(&ctx, json!({"n": 0})).success);
    let before: LedgerStatus = data(&ctx.status());

    let too_soon = ctx.rotate_key(
        "scheduled",
        Some(&token(&ctx, &[TokenScope::RotateKey], &["alice", "bob"])),
    );
    assert!(!too_soon.success);

    fx.clock.advance_secs(ctx.config().keys.min_rotation_interval_secs + 1);
    let one_approver = ctx.rotate_key(
        "scheduled",
        Some(&token(&ctx, &[TokenScope::RotateKey], &["alice"])),
    );
    assert_eq!(one_approver.error.as_ref().unwrap().details["cause"], "insufficient_approvals");

    let rotated = ctx.rotate_key(
        "scheduled",
        Some(&token(&ctx, &[TokenScope::RotateKey], &["alice", "bob"])),
    );
    assert!(rotated.success, "{rotated:?}");
    assert!(append(&ctx, json!({"n": 1})).success);

    let after: LedgerStatus = data(&ctx.status());
    assert_ne!(after.active_key, before.active_key);
    assert_eq!(after.lineage.keys.len(), 2);
    assert_eq!(after.entries, 3);
    assert!(ctx.divergence_scan(&NeverCancel).success);

    let revoked = ctx.revoke_key(
        &before.active_key,
        "retired for good",
        Some(&token(&ctx, &[TokenScope::Revoke], &["alice", "bob"])),
    );
    assert!(revoked.success, "{revoked:?}");
    drop(ctx);

    let ctx = fx.reopen();
    let status: LedgerStatus = data(&ctx.status());
    assert_eq!(status.active_key, after.active_key);
    assert_eq!(status.entries, 4);
}
