//! Configuration
//!
//! Resolution order: built-in defaults, then the TOML file (if present), then
//! `VIGIL_*` environment variables, then validation. Every field has a default
//! so an empty file is a valid configuration.

use crate::errors::{Result, VigilError};
use crate::hash::HashAlgorithmId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "VIGIL_";

/// Environment variable carrying the active governance token
pub const TOKEN_ENV_VAR: &str = "VIGIL_GOVERNANCE_TOKEN";

/// Index storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackendKind {
    /// `index.jsonl` under the data directory
    #[default]
    File,
    /// In-process only, rebuilt on every open
    Memory,
}

/// Governance token settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of issued tokens
    pub default_ttl_secs: u64,
    /// Upper bound on remembered consumed nonces
    pub max_consumed_nonces: usize,
    /// Distinct approvers required for key rotation and revocation
    pub required_rotation_approvals: usize,
    /// Distinct approvers required to publish, activate or roll back a policy
    pub required_policy_approvals: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_consumed_nonces: 10_000,
            required_rotation_approvals: 2,
            required_policy_approvals: 1,
        }
    }
}

/// Signing key settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Minimum spacing between rotations
    pub min_rotation_interval_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            min_rotation_interval_secs: 3600,
        }
    }
}

/// Parallel replay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Fixed worker pool size
    pub workers: usize,
    /// Default number of contiguous segments
    pub segments: usize,
    /// Advisory time budget; exceeding it is reported, not fatal
    pub time_budget_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            segments: 8,
            time_budget_ms: 1000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Directory holding the ledger and all derived state
    pub data_dir: PathBuf,
    /// Digest algorithm, fixed for the lifetime of a ledger
    pub hash_algorithm: HashAlgorithmId,
    /// Index backend
    pub index_backend: IndexBackendKind,
    /// Token guard settings
    pub token: TokenConfig,
    /// Key manager settings
    pub keys: KeyConfig,
    /// Parallel replay settings
    pub replay: ReplayConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".vigil"),
            hash_algorithm: HashAlgorithmId::default(),
            index_backend: IndexBackendKind::default(),
            token: TokenConfig::default(),
            keys: KeyConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl VigilConfig {
    /// Configuration rooted at `data_dir` with all other defaults
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VigilError::config(format!("invalid TOML: {e}")))
    }

    /// Load from a file; a missing file yields defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "loading configuration");
                Self::from_toml_str(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "configuration file absent, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(VigilError::config(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load, overlay the process environment, validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `VIGIL_*` variables from the process environment
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_env_vars(std::env::vars())
    }

    /// Overlay `VIGIL_*` variables from an explicit source
    pub fn merge_env_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "DATA_DIR" => self.data_dir = PathBuf::from(value),
                "HASH_ALGORITHM" => self.hash_algorithm = value.parse()?,
                "INDEX_BACKEND" => {
                    self.index_backend = match value.to_ascii_lowercase().as_str() {
                        "file" => IndexBackendKind::File,
                        "memory" => IndexBackendKind::Memory,
                        other => {
                            return Err(VigilError::config(format!(
                                "unknown index backend '{other}'"
                            )))
                        }
                    }
                }
                "TOKEN_TTL_SECS" => self.token.default_ttl_secs = parse_number(&key, &value)?,
                "MAX_CONSUMED_NONCES" => {
                    self.token.max_consumed_nonces = parse_number(&key, &value)?;
                }
                "ROTATION_APPROVALS" => {
                    self.token.required_rotation_approvals = parse_number(&key, &value)?;
                }
                "POLICY_APPROVALS" => {
                    self.token.required_policy_approvals = parse_number(&key, &value)?;
                }
                "MIN_ROTATION_INTERVAL_SECS" => {
                    self.keys.min_rotation_interval_secs = parse_number(&key, &value)?;
                }
                "REPLAY_WORKERS" => self.replay.workers = parse_number(&key, &value)?,
                "REPLAY_SEGMENTS" => self.replay.segments = parse_number(&key, &value)?,
                "REPLAY_TIME_BUDGET_MS" => {
                    self.replay.time_budget_ms = parse_number(&key, &value)?;
                }
                // The token is a credential, not configuration.
                "GOVERNANCE_TOKEN" => {}
                _ => debug!(variable = %key, "ignoring unrecognised environment override"),
            }
        }
        Ok(())
    }

    /// Reject values the rest of the system cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(VigilError::config("data_dir must not be empty"));
        }
        if self.token.default_ttl_secs == 0 {
            return Err(VigilError::config("token.default_ttl_secs must be positive"));
        }
        if self.token.max_consumed_nonces == 0 {
            return Err(VigilError::config(
                "token.max_consumed_nonces must be positive",
            ));
        }
        if self.token.required_rotation_approvals == 0 {
            return Err(VigilError::config(
                "token.required_rotation_approvals must be at least 1",
            ));
        }
        if self.replay.workers == 0 || self.replay.segments == 0 {
            return Err(VigilError::config(
                "replay.workers and replay.segments must be positive",
            ));
        }
        Ok(())
    }

    /// File layout under `data_dir`
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            VigilError::config(format!(
                "{key} must be a non-negative integer, got '{value}'"
            ))
        })
}

/// Locations of every persisted artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    /// Root directory
    pub root: PathBuf,
    /// Authoritative ledger frames
    pub ledger: PathBuf,
    /// Persisted Merkle root and peaks
    pub merkle_state: PathBuf,
    /// Append-only log of Merkle node digests
    pub merkle_nodes: PathBuf,
    /// File index backend
    pub index: PathBuf,
    /// Token guard state
    pub token_state: PathBuf,
    /// Key material and lineage
    pub keys: PathBuf,
    /// Last repair report
    pub repair_report: PathBuf,
}

impl DataPaths {
    /// Layout rooted at `root`
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ledger: root.join("ledger.jsonl"),
            merkle_state: root.join("merkle_state.json"),
            merkle_nodes: root.join("merkle_nodes.log"),
            index: root.join("index.jsonl"),
            token_state: root.join("token_state.json"),
            keys: root.join("keys"),
            repair_report: root.join("repair.json"),
        }
    }
}
