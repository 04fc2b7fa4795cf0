//! Unified error taxonomy for Vigil
//!
//! Every fallible operation in the workspace returns [`VigilError`]. Structural
//! integrity failures (`ChainBreak`, `MerkleDivergence`) always carry enough
//! positional detail to act on; they are never folded into a generic message.

use crate::hash::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger sequence number (zero-based, gapless)
pub type Sequence = u64;

/// Why a governance token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFailure {
    /// No token was presented
    Missing,
    /// The token could not be decoded
    Malformed,
    /// The guard never issued this token
    Unknown,
    /// The token's lifetime has elapsed
    Expired,
    /// The token's nonce was already consumed
    Replayed,
    /// The token does not carry the scope required by the operation
    Unauthorized,
    /// Fewer distinct approvers than the operation requires
    InsufficientApprovals,
    /// The consumed-nonce set is full of unexpired entries
    CapacityExhausted,
}

impl fmt::Display for TokenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TokenFailure::Missing => "missing",
            TokenFailure::Malformed => "malformed",
            TokenFailure::Unknown => "unknown",
            TokenFailure::Expired => "expired",
            TokenFailure::Replayed => "replayed",
            TokenFailure::Unauthorized => "unauthorized",
            TokenFailure::InsufficientApprovals => "insufficient approvals",
            TokenFailure::CapacityExhausted => "capacity exhausted",
        };
        f.write_str(label)
    }
}

/// Stable discriminant used in machine-readable reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Non-canonicalizable input
    Serialization,
    /// On-disk hash chain corruption
    ChainBreak,
    /// Persisted Merkle root differs from replay
    MerkleDivergence,
    /// Token expired, replayed, unknown or unauthorized
    GovernanceToken,
    /// Unknown or invalid policy version
    PolicyVersion,
    /// Unverifiable signature or unknown/revoked key
    Signature,
    /// I/O or persistence failure
    Storage,
    /// Invalid argument or state
    Invalid,
    /// Requested item does not exist
    NotFound,
    /// Cooperative cancellation was requested
    Cancelled,
    /// Configuration could not be loaded or validated
    Config,
}

/// Unified error type for all Vigil operations
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VigilError {
    /// Value cannot be canonically encoded or decoded
    #[error("Serialization error: {message}")]
    Serialization {
        /// What could not be encoded
        message: String,
    },

    /// Hash chain is broken at `sequence`
    #[error("Chain break at sequence {sequence}: expected {expected}, found {actual}")]
    ChainBreak {
        /// First sequence where the chain does not hold
        sequence: Sequence,
        /// Digest the chain requires at this position
        expected: Digest,
        /// Digest actually recorded
        actual: Digest,
    },

    /// Persisted Merkle root differs from the replayed root
    #[error("Merkle divergence: persisted {persisted_root}, replayed {replayed_root}")]
    MerkleDivergence {
        /// Root read from the persisted accumulator
        persisted_root: Digest,
        /// Root recomputed from the ledger
        replayed_root: Digest,
        /// First leaf whose digest differs, if it could be located
        first_divergent_leaf: Option<Sequence>,
    },

    /// Governance token refused
    #[error("Governance token rejected ({cause}): {message}")]
    GovernanceToken {
        /// Specific cause
        cause: TokenFailure,
        /// Human readable context
        message: String,
    },

    /// Policy version unknown or not eligible
    #[error("Policy version error: {message}")]
    PolicyVersion {
        /// Human readable context
        message: String,
    },

    /// Signature could not be produced or verified
    #[error("Signature error: {message}")]
    Signature {
        /// Key involved, if any
        key_id: Option<String>,
        /// Human readable context
        message: String,
    },

    /// Persistence failed
    #[error("Storage error: {message}")]
    Storage {
        /// Human readable context
        message: String,
    },

    /// Invalid input or state
    #[error("Invalid: {message}")]
    Invalid {
        /// Human readable context
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// Operation aborted by a cancellation signal
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Where the operation stopped
        message: String,
    },

    /// Configuration problem
    #[error("Configuration error: {message}")]
    Config {
        /// Human readable context
        message: String,
    },
}

impl VigilError {
    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a chain break error
    pub fn chain_break(sequence: Sequence, expected: Digest, actual: Digest) -> Self {
        Self::ChainBreak {
            sequence,
            expected,
            actual,
        }
    }

    /// Create a Merkle divergence error
    pub fn merkle_divergence(
        persisted_root: Digest,
        replayed_root: Digest,
        first_divergent_leaf: Option<Sequence>,
    ) -> Self {
        Self::MerkleDivergence {
            persisted_root,
            replayed_root,
            first_divergent_leaf,
        }
    }

    /// Create a governance token error
    pub fn token(cause: TokenFailure, message: impl Into<String>) -> Self {
        Self::GovernanceToken {
            cause,
            message: message.into(),
        }
    }

    /// Create a policy version error
    pub fn policy_version(message: impl Into<String>) -> Self {
        Self::PolicyVersion {
            message: message.into(),
        }
    }

    /// Create a signature error naming the key involved
    pub fn signature(key_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Signature {
            key_id: key_id.map(str::to_owned),
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Stable discriminant for reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::ChainBreak { .. } => ErrorKind::ChainBreak,
            Self::MerkleDivergence { .. } => ErrorKind::MerkleDivergence,
            Self::GovernanceToken { .. } => ErrorKind::GovernanceToken,
            Self::PolicyVersion { .. } => ErrorKind::PolicyVersion,
            Self::Signature { .. } => ErrorKind::Signature,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Token failure cause, if this is a token error
    pub fn token_failure(&self) -> Option<TokenFailure> {
        match self {
            Self::GovernanceToken { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Structural integrity failures must never be downgraded
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChainBreak { .. } | Self::MerkleDivergence { .. })
    }
}

/// Standard Result type for Vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;

impl From<std::io::Error> for VigilError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let err = VigilError::token(TokenFailure::Replayed, "nonce reused");
        assert_eq!(err.kind(), ErrorKind::GovernanceToken);
        assert_eq!(err.token_failure(), Some(TokenFailure::Replayed));
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn test_chain_break_is_integrity_failure() {
        let err = VigilError::chain_break(2, Digest::ZERO, Digest::ZERO);
        assert!(err.is_integrity_failure());
        assert!(err.to_string().contains("sequence 2"));
    }

    #[test]
    fn test_error_serializes_with_kind_tag() {
        let err = VigilError::policy_version("unknown target");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "policy_version");
        assert_eq!(json["message"], "unknown target");
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(VigilError::from(io).kind(), ErrorKind::NotFound);
    }
}
