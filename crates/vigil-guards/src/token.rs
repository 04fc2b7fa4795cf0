//! Governance token value type and its string encoding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use vigil_core::{
    codec, domain, Digest, HashAlgorithmId, Result, Timestamp, TokenFailure, VigilError,
};

/// Operation a token authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Append an ordinary payload or decision receipt
    Append,
    /// Activate an earlier policy version
    Rollback,
    /// Publish or activate a policy version
    Publish,
    /// Rotate the signing key
    RotateKey,
    /// Revoke a retired key
    Revoke,
    /// Replace live state with a restored snapshot
    Repair,
}

impl TokenScope {
    /// Every scope, for operator convenience
    pub const ALL: [TokenScope; 6] = [
        TokenScope::Append,
        TokenScope::Rollback,
        TokenScope::Publish,
        TokenScope::RotateKey,
        TokenScope::Revoke,
        TokenScope::Repair,
    ];
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TokenScope::Append => "append",
            TokenScope::Rollback => "rollback",
            TokenScope::Publish => "publish",
            TokenScope::RotateKey => "rotate_key",
            TokenScope::Revoke => "revoke",
            TokenScope::Repair => "repair",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for TokenScope {
    type Err = VigilError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "append" | "write" => Ok(TokenScope::Append),
            "rollback" => Ok(TokenScope::Rollback),
            "publish" => Ok(TokenScope::Publish),
            "rotate_key" | "rotate" => Ok(TokenScope::RotateKey),
            "revoke" => Ok(TokenScope::Revoke),
            "repair" => Ok(TokenScope::Repair),
            other => Err(VigilError::invalid(format!("unknown token scope '{other}'"))),
        }
    }
}

/// Short-lived, single-use credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceToken {
    /// Unique nonce; consumed exactly once
    pub nonce: Uuid,
    /// Issuance instant
    pub issued_at: Timestamp,
    /// Lifetime in seconds
    pub ttl_secs: u64,
    /// Operations this token authorizes
    pub scopes: BTreeSet<TokenScope>,
    /// Distinct approvers that signed off on issuance
    pub approvals: BTreeSet<String>,
}

impl GovernanceToken {
    /// Instant after which the token is refused
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.issued_at.checked_add_secs(self.ttl_secs)
    }

    /// Whether the token carries `scope`
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Binding digest over every field
    pub fn fingerprint(&self, algorithm: HashAlgorithmId) -> Result<Digest> {
        codec::canonical_digest(algorithm, domain::TOKEN, self)
    }

    /// Base64url string of the canonical encoding
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(codec::encode(self)?))
    }

    /// Parse a presented token string
    pub fn parse(value: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value.trim()).map_err(|e| {
            VigilError::token(TokenFailure::Malformed, format!("not base64url: {e}"))
        })?;
        codec::decode(&bytes).map_err(|e| VigilError::token(TokenFailure::Malformed, e.to_string()))
    }
}
