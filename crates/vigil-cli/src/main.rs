//! Vigil operator CLI
//!
//! Thin front end over `vigil_runtime`: parses arguments, opens one
//! `LedgerContext`, runs one command and prints its report as JSON on
//! stdout. Logs go to stderr. The exit status is non-zero when the report
//! says `success: false`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vigil_core::config::TOKEN_ENV_VAR;
use vigil_core::{Clock, Digest, KeyId, NeverCancel, SystemClock, VigilConfig, VigilError};
use vigil_governance::PolicyVersion;
use vigil_guards::TokenScope;
use vigil_runtime::{default_bundle_path, CommandReport, DecisionRequest, LedgerContext};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Vigil - tamper-evident ledger and governance kernel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".vigil/config.toml")]
    config: PathBuf,

    /// Data directory, overriding the config file and environment
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Governance token; falls back to VIGIL_GOVERNANCE_TOKEN
    #[arg(long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show ledger, key and token status
    Status,

    /// Issue a single-use governance token
    IssueToken {
        /// Operation the token authorizes (repeatable)
        #[arg(short, long = "scope", required = true)]
        scopes: Vec<TokenScope>,

        /// Approver recorded on the token (repeatable)
        #[arg(short, long = "approver")]
        approvers: Vec<String>,

        /// Lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Append a JSON payload (inline, or @path to read a file)
    #[command(alias = "write")]
    Append {
        /// Payload
        payload: String,
    },

    /// Publish a policy version from JSON (inline or @path)
    PublishPolicy {
        /// Policy version
        policy: String,
    },

    /// Activate a published successor of the active version
    ActivatePolicy {
        /// Policy hash
        #[arg(value_parser = parse_digest)]
        hash: Digest,

        /// Why
        #[arg(short, long)]
        reason: String,
    },

    /// Reactivate a previously active version
    RollbackPolicy {
        /// Policy hash
        #[arg(value_parser = parse_digest)]
        hash: Digest,

        /// Why
        #[arg(short, long)]
        reason: String,
    },

    /// Evaluate a decision request (inline JSON or @path)
    EvaluateDecision {
        /// Decision request
        request: String,

        /// Append the signed receipt instead of a dry run
        #[arg(long)]
        record: bool,
    },

    /// Rotate the active signing key
    RotateKey {
        /// Why
        #[arg(short, long)]
        reason: String,
    },

    /// Revoke a retired signing key
    RevokeKey {
        /// Key id
        key_id: String,

        /// Why
        #[arg(short, long)]
        reason: String,
    },

    /// Recompute everything and report every divergence
    DivergenceScan,

    /// Rebuild index and Merkle state from the ledger
    AutoRepair,

    /// Recompute the Merkle root on a worker pool
    ParallelReplay {
        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Contiguous segments
        #[arg(short, long)]
        segments: Option<usize>,
    },

    /// Pin the current artifact digests as a reference set
    ReproducibilityCapture {
        /// Reference set to write
        #[arg(short, long)]
        out: PathBuf,

        /// Toolchain manifest to pin as well
        #[arg(long)]
        toolchain_manifest: Option<PathBuf>,
    },

    /// Compare pinned artifacts with a reference set
    ReproducibilityAudit {
        /// Reference set to read
        #[arg(short, long)]
        reference: PathBuf,

        /// Toolchain manifest to audit as well
        #[arg(long)]
        toolchain_manifest: Option<PathBuf>,
    },

    /// Export a snapshot bundle
    SnapshotExport {
        /// Bundle path; defaults to the data directory's snapshots/
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Restore a snapshot bundle over the live state
    SnapshotRestore {
        /// Bundle path
        bundle: PathBuf,
    },

    /// Replay the ledger and summarize governance history
    GovernanceReplay,

    /// Field-by-field difference of two decision receipts
    DiffReceipts {
        /// Sequence of the first receipt
        left: u64,
        /// Sequence of the second receipt
        right: u64,
    },
}

fn parse_digest(value: &str) -> std::result::Result<Digest, String> {
    Digest::from_hex(value.trim()).map_err(|e| format!("not a 32-byte hex digest: {e}"))
}

/// Inline JSON, or `@path` to read it from a file
fn read_json<T: DeserializeOwned>(argument: &str) -> vigil_core::Result<T> {
    let text = match argument.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path)).map_err(|e| {
            VigilError::invalid(format!("cannot read {path}: {e}"))
        })?,
        None => argument.to_owned(),
    };
    serde_json::from_str(&text).map_err(|e| VigilError::invalid(format!("invalid JSON input: {e}")))
}

fn load_config(cli: &Cli) -> Result<VigilConfig> {
    let mut config = VigilConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        algorithm = %config.hash_algorithm,
        "configuration loaded"
    );
    Ok(config)
}

fn run(cli: &Cli, ctx: &LedgerContext) -> CommandReport {
    let token = cli.token.clone().or_else(|| std::env::var(TOKEN_ENV_VAR).ok());
    let token = token.as_deref();
    let now = ctx.clock().now();

    match &cli.command {
        Commands::Status => ctx.status(),
        Commands::IssueToken {
            scopes,
            approvers,
            ttl,
        } => ctx.issue_token(scopes, approvers, *ttl),
        Commands::Append { payload } => match read_json::<serde_json::Value>(payload) {
            Ok(payload) => ctx.append(&payload, token),
            Err(e) => CommandReport::failed("append", now, &e),
        },
        Commands::PublishPolicy { policy } => match read_json::<PolicyVersion>(policy) {
            Ok(version) => ctx.publish_policy(version, token),
            Err(e) => CommandReport::failed("publish-policy", now, &e),
        },
        Commands::ActivatePolicy { hash, reason } => ctx.activate_policy(*hash, reason, token),
        Commands::RollbackPolicy { hash, reason } => ctx.rollback_policy(*hash, reason, token),
        Commands::EvaluateDecision { request, record } => {
            match read_json::<DecisionRequest>(request) {
                Ok(request) => ctx.evaluate_decision(request, *record, token),
                Err(e) => CommandReport::failed("evaluate-decision", now, &e),
            }
        }
        Commands::RotateKey { reason } => ctx.rotate_key(reason, token),
        Commands::RevokeKey { key_id, reason } => {
            ctx.revoke_key(&KeyId::new(key_id.as_str()), reason, token)
        }
        Commands::DivergenceScan => ctx.divergence_scan(&NeverCancel),
        Commands::AutoRepair => ctx.auto_repair(&NeverCancel),
        Commands::ParallelReplay { workers, segments } => {
            ctx.parallel_replay(*workers, *segments, &NeverCancel)
        }
        Commands::ReproducibilityCapture {
            out,
            toolchain_manifest,
        } => ctx.capture_reference(out, toolchain_manifest.as_deref()),
        Commands::ReproducibilityAudit {
            reference,
            toolchain_manifest,
        } => ctx.reproducibility_audit(reference, toolchain_manifest.as_deref()),
        Commands::SnapshotExport { out } => {
            let dest = out.clone().unwrap_or_else(|| default_bundle_path(ctx, now));
            ctx.snapshot_export(&dest)
        }
        Commands::SnapshotRestore { bundle } => ctx.snapshot_restore(bundle, token, &NeverCancel),
        Commands::GovernanceReplay => ctx.governance_replay(),
        Commands::DiffReceipts { left, right } => ctx.diff_receipts(*left, *right),
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let ctx = LedgerContext::open(config, Arc::new(SystemClock))
        .context("opening ledger context")?;

    let report = run(&cli, &ctx);
    println!("{}", report.to_json_pretty()?);
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_issue_token_takes_repeated_scopes() {
        let cli = Cli::try_parse_from([
            "vigil", "issue-token", "--scope", "publish", "--scope", "rollback", "-a", "alice",
        ])
        .unwrap();
        match cli.command {
            Commands::IssueToken { scopes, approvers, ttl } => {
                assert_eq!(scopes, vec![TokenScope::Publish, TokenScope::Rollback]);
                assert_eq!(approvers, vec!["alice".to_owned()]);
                assert_eq!(ttl, None);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_policy_hash_must_be_hex() {
        assert!(Cli::try_parse_from(["vigil", "rollback-policy", "zz", "-r", "undo"]).is_err());
        let hex = "ab".repeat(32);
        let cli = Cli::try_parse_from(["vigil", "rollback-policy", &hex, "-r", "undo"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::RollbackPolicy { hash, .. } if hash == Digest([0xab; 32])
        ));
    }

    #[test]
    fn test_json_input_inline_or_from_file() {
        let inline: serde_json::Value = read_json(r#"{"a":1}"#).unwrap();
        assert_eq!(inline["a"], 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.json");
        std::fs::write(&path, r#"{"b":2}"#).unwrap();
        let from_file: serde_json::Value = read_json(&format!("@{}", path.display())).unwrap();
        assert_eq!(from_file["b"], 2);

        let err = read_json::<serde_json::Value>("{oops").unwrap_err();
        assert_eq!(err.kind(), vigil_core::ErrorKind::Invalid);
    }
}
