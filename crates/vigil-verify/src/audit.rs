//! Reproducibility audit
//!
//! Hashes pinned artifacts (the ledger file, the Merkle state file and a
//! toolchain manifest such as `Cargo.lock`) and compares them with a trusted
//! reference set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vigil_core::persist::{read_optional, write_atomic};
use vigil_core::{codec, DataPaths, Digest, HashAlgorithmId, Result, VigilError};

/// Artifact name for the ledger file
pub const LEDGER_ARTIFACT: &str = "ledger";
/// Artifact name for the Merkle state file
pub const MERKLE_STATE_ARTIFACT: &str = "merkle_state";
/// Artifact name for the toolchain manifest
pub const TOOLCHAIN_ARTIFACT: &str = "toolchain_manifest";

/// Trusted digests for pinned artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    /// Algorithm the digests were computed with
    pub algorithm: HashAlgorithmId,
    /// Expected digest per artifact name
    #[serde(default)]
    pub artifacts: BTreeMap<String, Digest>,
    /// Digests known to be compromised, whatever artifact they appear on
    #[serde(default)]
    pub compromised: BTreeSet<Digest>,
}

impl ReferenceSet {
    /// Load a reference set written by [`ReferenceSet::save`] or by hand
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = read_optional(path)?
            .ok_or_else(|| VigilError::not_found(format!("reference set {}", path.display())))?;
        codec::decode(&bytes)
    }

    /// Persist atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &codec::encode(self)?)
    }

    /// Pin the current digests of `artifacts`; missing files are skipped
    pub fn capture(artifacts: &[PinnedArtifact], algorithm: HashAlgorithmId) -> Result<Self> {
        let mut pinned = BTreeMap::new();
        for artifact in artifacts {
            if let Some(digest) = hash_file(&artifact.path, algorithm)? {
                pinned.insert(artifact.name.clone(), digest);
            }
        }
        Ok(Self {
            algorithm,
            artifacts: pinned,
            compromised: BTreeSet::new(),
        })
    }
}

/// A named file under audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedArtifact {
    /// Name used in the reference set
    pub name: String,
    /// File location
    pub path: PathBuf,
}

impl PinnedArtifact {
    /// Named artifact at `path`
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// The standard artifact set for a data directory
pub fn pinned_artifacts(
    paths: &DataPaths,
    toolchain_manifest: Option<&Path>,
) -> Vec<PinnedArtifact> {
    let mut artifacts = vec![
        PinnedArtifact::new(LEDGER_ARTIFACT, &paths.ledger),
        PinnedArtifact::new(MERKLE_STATE_ARTIFACT, &paths.merkle_state),
    ];
    if let Some(manifest) = toolchain_manifest {
        artifacts.push(PinnedArtifact::new(TOOLCHAIN_ARTIFACT, manifest));
    }
    artifacts
}

/// Outcome for one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Digest equals the reference
    Match,
    /// Digest differs from the reference, or there is no reference for it
    Drift,
    /// Digest is on the compromised list
    Compromised,
    /// File does not exist
    Missing,
}

/// Audit line for one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactAudit {
    /// Artifact name
    pub name: String,
    /// File audited
    pub path: PathBuf,
    /// Digest observed now
    pub observed: Option<Digest>,
    /// Digest in the reference set
    pub expected: Option<Digest>,
    /// Verdict
    pub status: ArtifactStatus,
}

/// Full audit result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Algorithm used
    pub algorithm: HashAlgorithmId,
    /// One line per artifact, in the order given
    pub artifacts: Vec<ArtifactAudit>,
    /// Whether every artifact matched
    pub consistent: bool,
}

fn hash_file(path: &Path, algorithm: HashAlgorithmId) -> Result<Option<Digest>> {
    Ok(read_optional(path)?.map(|bytes| algorithm.hash(&bytes)))
}

/// Hash `artifacts` and compare them with `reference`
pub fn reproducibility_audit(
    artifacts: &[PinnedArtifact],
    reference: &ReferenceSet,
) -> Result<AuditReport> {
    let algorithm = reference.algorithm;
    let mut lines = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let observed = hash_file(&artifact.path, algorithm)?;
        let expected = reference.artifacts.get(&artifact.name).copied();
        let status = match observed {
            None => ArtifactStatus::Missing,
            Some(d) if reference.compromised.contains(&d) => ArtifactStatus::Compromised,
            Some(d) if Some(d) == expected => ArtifactStatus::Match,
            Some(_) => ArtifactStatus::Drift,
        };
        if status != ArtifactStatus::Match {
            warn!(artifact = %artifact.name, ?status, "artifact does not match its reference");
        }
        lines.push(ArtifactAudit {
            name: artifact.name.clone(),
            path: artifact.path.clone(),
            observed,
            expected,
            status,
        });
    }
    let consistent = lines.iter().all(|l| l.status == ArtifactStatus::Match);
    info!(artifacts = lines.len(), consistent, "reproducibility audit complete");
    Ok(AuditReport {
        algorithm,
        artifacts: lines,
        consistent,
    })
}
