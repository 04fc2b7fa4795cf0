//! Token guard: issuance, single-use consumption, persisted nonce state
//!
//! The consumed set is bounded by `capacity`. Entries are pruned once their
//! token has expired, since an expired nonce is refused regardless. If the set
//! is still full after pruning, consumption fails with `CapacityExhausted`
//! rather than forgetting a live nonce.

use crate::token::{GovernanceToken, TokenScope};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::persist::{read_optional, write_atomic};
use vigil_core::{codec, Digest, HashAlgorithmId, Result, Timestamp, TokenFailure, VigilError};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssuedRecord {
    fingerprint: Digest,
    expires_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsumedRecord {
    consumed_at: Timestamp,
    expires_at: Timestamp,
    scope: TokenScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GuardState {
    version: u32,
    issued: BTreeMap<Uuid, IssuedRecord>,
    consumed: BTreeMap<Uuid, ConsumedRecord>,
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            issued: BTreeMap::new(),
            consumed: BTreeMap::new(),
        }
    }
}

impl GuardState {
    fn prune(&mut self, now: Timestamp) -> usize {
        let before = self.issued.len() + self.consumed.len();
        self.issued.retain(|_, record| record.expires_at >= now);
        self.consumed.retain(|_, record| record.expires_at >= now);
        before - self.issued.len() - self.consumed.len()
    }
}

/// Proof that a token was consumed for a specific scope
///
/// Not `Clone`: each grant authorizes exactly one operation.
#[derive(Debug)]
pub struct ConsumedGrant {
    nonce: Uuid,
    scope: TokenScope,
    approvals: BTreeSet<String>,
    consumed_at: Timestamp,
}

impl ConsumedGrant {
    /// Nonce of the consumed token
    pub fn nonce(&self) -> Uuid {
        self.nonce
    }

    /// Scope the grant was consumed for
    pub fn scope(&self) -> TokenScope {
        self.scope
    }

    /// Approvers recorded on the token
    pub fn approvals(&self) -> &BTreeSet<String> {
        &self.approvals
    }

    /// When consumption happened
    pub fn consumed_at(&self) -> Timestamp {
        self.consumed_at
    }

    /// Fail unless the grant was consumed for `scope`
    pub fn require(&self, scope: TokenScope) -> Result<()> {
        if self.scope == scope {
            Ok(())
        } else {
            Err(VigilError::token(
                TokenFailure::Unauthorized,
                format!("grant consumed for {}, operation needs {scope}", self.scope),
            ))
        }
    }
}

/// Snapshot of guard bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardStatus {
    /// Outstanding issued tokens
    pub outstanding: usize,
    /// Remembered consumed nonces
    pub consumed: usize,
    /// Consumed-set bound
    pub capacity: usize,
}

/// Issues and consumes governance tokens
pub struct TokenGuard {
    path: Option<PathBuf>,
    algorithm: HashAlgorithmId,
    capacity: usize,
    state: Mutex<GuardState>,
}

impl TokenGuard {
    /// Open a guard persisted at `path`, loading prior state
    pub fn open(path: &Path, algorithm: HashAlgorithmId, capacity: usize) -> Result<Self> {
        let state = match read_optional(path)? {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                let state: GuardState = codec::decode(&bytes)?;
                if state.version != STATE_VERSION {
                    return Err(VigilError::storage(format!(
                        "token state version {} is not supported",
                        state.version
                    )));
                }
                state
            }
            _ => GuardState::default(),
        };
        debug!(
            path = %path.display(),
            consumed = state.consumed.len(),
            outstanding = state.issued.len(),
            "token guard opened"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            algorithm,
            capacity: capacity.max(1),
            state: Mutex::new(state),
        })
    }

    /// Guard with no persistence, for tests and dry runs
    pub fn in_memory(algorithm: HashAlgorithmId, capacity: usize) -> Self {
        Self {
            path: None,
            algorithm,
            capacity: capacity.max(1),
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Issue a new token
    pub fn issue(
        &self,
        ttl_secs: u64,
        scopes: impl IntoIterator<Item = TokenScope>,
        approvals: impl IntoIterator<Item = String>,
        now: Timestamp,
    ) -> Result<GovernanceToken> {
        let token = GovernanceToken {
            nonce: Uuid::new_v4(),
            issued_at: now,
            ttl_secs,
            scopes: scopes.into_iter().collect(),
            approvals: approvals
                .into_iter()
                .map(|a| a.trim().to_owned())
                .filter(|a| !a.is_empty())
                .collect(),
        };
        if token.scopes.is_empty() {
            return Err(VigilError::invalid("a token must carry at least one scope"));
        }
        let expires_at = token
            .expires_at()
            .ok_or_else(|| VigilError::invalid("token lifetime overflows the calendar"))?;
        let fingerprint = token.fingerprint(self.algorithm)?;

        let mut state = self.state.lock();
        state.prune(now);
        state.issued.insert(
            token.nonce,
            IssuedRecord {
                fingerprint,
                expires_at,
            },
        );
        self.persist(&state)?;
        info!(
            nonce = %token.nonce,
            ttl_secs,
            scopes = token.scopes.len(),
            "governance token issued"
        );
        Ok(token)
    }

    /// Consume a token presented as a string (or not presented at all)
    pub fn consume_presented(
        &self,
        presented: Option<&str>,
        scope: TokenScope,
        required_approvals: usize,
        now: Timestamp,
    ) -> Result<ConsumedGrant> {
        let raw = presented
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                VigilError::token(TokenFailure::Missing, "no governance token presented")
            })?;
        let token = GovernanceToken::parse(raw)?;
        self.consume(&token, scope, required_approvals, now)
    }

    /// Consume a token for one operation
    ///
    /// The nonce is recorded, and persisted, before the grant is returned.
    pub fn consume(
        &self,
        token: &GovernanceToken,
        scope: TokenScope,
        required_approvals: usize,
        now: Timestamp,
    ) -> Result<ConsumedGrant> {
        let fingerprint = token.fingerprint(self.algorithm)?;
        let mut state = self.state.lock();
        state.prune(now);

        if state.consumed.contains_key(&token.nonce) {
            warn!(nonce = %token.nonce, "governance token replay rejected");
            return Err(VigilError::token(
                TokenFailure::Replayed,
                format!("nonce {} was already consumed", token.nonce),
            ));
        }

        let Some(issued) = state.issued.get(&token.nonce).cloned() else {
            // Expired tokens are pruned from the issued map, so check the
            // token's own expiry before calling it unknown.
            if token.expires_at().map_or(true, |expiry| now > expiry) {
                return Err(VigilError::token(
                    TokenFailure::Expired,
                    format!("token {} expired", token.nonce),
                ));
            }
            return Err(VigilError::token(
                TokenFailure::Unknown,
                format!("nonce {} was never issued by this guard", token.nonce),
            ));
        };

        if issued.fingerprint != fingerprint {
            warn!(nonce = %token.nonce, "token contents do not match issuance record");
            return Err(VigilError::token(
                TokenFailure::Unknown,
                "token contents differ from what was issued",
            ));
        }

        if now > issued.expires_at {
            state.issued.remove(&token.nonce);
            return Err(VigilError::token(
                TokenFailure::Expired,
                format!("token expired at {}", issued.expires_at),
            ));
        }

        if !token.has_scope(scope) {
            return Err(VigilError::token(
                TokenFailure::Unauthorized,
                format!("token does not carry the {scope} scope"),
            ));
        }

        if token.approvals.len() < required_approvals {
            return Err(VigilError::token(
                TokenFailure::InsufficientApprovals,
                format!(
                    "{} distinct approvals, {required_approvals} required",
                    token.approvals.len()
                ),
            ));
        }

        if state.consumed.len() >= self.capacity {
            warn!(capacity = self.capacity, "consumed nonce set is full");
            return Err(VigilError::token(
                TokenFailure::CapacityExhausted,
                format!("{} unexpired nonces already recorded", self.capacity),
            ));
        }

        state.issued.remove(&token.nonce);
        state.consumed.insert(
            token.nonce,
            ConsumedRecord {
                consumed_at: now,
                expires_at: issued.expires_at,
                scope,
            },
        );
        // The nonce stays consumed in memory even if persisting fails.
        self.persist(&state)?;
        debug!(nonce = %token.nonce, %scope, "governance token consumed");

        Ok(ConsumedGrant {
            nonce: token.nonce,
            scope,
            approvals: token.approvals.clone(),
            consumed_at: now,
        })
    }

    /// Whether a nonce is currently remembered as consumed
    pub fn is_consumed(&self, nonce: &Uuid) -> bool {
        self.state.lock().consumed.contains_key(nonce)
    }

    /// Current bookkeeping counts
    pub fn status(&self) -> GuardStatus {
        let state = self.state.lock();
        GuardStatus {
            outstanding: state.issued.len(),
            consumed: state.consumed.len(),
            capacity: self.capacity,
        }
    }

    fn persist(&self, state: &GuardState) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &codec::encode(state)?),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TokenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGuard")
            .field("path", &self.path)
            .field("algorithm", &self.algorithm)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use vigil_core::{Clock, ManualClock};

    fn approvers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    fn failure(err: VigilError) -> TokenFailure {
        err.token_failure().unwrap()
    }

    #[test]
    fn test_consume_once() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 16);
        let token = guard
            .issue(60, [TokenScope::Append], approvers(&["ops"]), clock.now())
            .unwrap();

        let grant = guard.consume(&token, TokenScope::Append, 1, clock.now()).unwrap();
        assert_eq!(grant.nonce(), token.nonce);
        assert!(grant.require(TokenScope::Append).is_ok());
        assert!(grant.require(TokenScope::Rollback).is_err());

        let err = guard
            .consume(&token, TokenScope::Append, 1, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Replayed);
    }

    #[test]
    fn test_replay_rejected_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_state.json");
        let clock = ManualClock::at_epoch();
        let token = {
            let guard = TokenGuard::open(&path, HashAlgorithmId::Sha256, 16).unwrap();
            let token = guard
                .issue(300, [TokenScope::Append], Vec::new(), clock.now())
                .unwrap();
            guard.consume(&token, TokenScope::Append, 0, clock.now()).unwrap();
            token
        };

        let reopened = TokenGuard::open(&path, HashAlgorithmId::Sha256, 16).unwrap();
        assert!(reopened.is_consumed(&token.nonce));
        let err = reopened
            .consume(&token, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Replayed);
    }

    #[test]
    fn test_issued_token_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_state.json");
        let clock = ManualClock::at_epoch();
        let token = TokenGuard::open(&path, HashAlgorithmId::Sha256, 16)
            .unwrap()
            .issue(300, [TokenScope::Repair], Vec::new(), clock.now())
            .unwrap();
        let reopened = TokenGuard::open(&path, HashAlgorithmId::Sha256, 16).unwrap();
        assert!(reopened
            .consume(&token, TokenScope::Repair, 0, clock.now())
            .is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 16);
        let token = guard
            .issue(30, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();
        clock.advance_secs(31);
        let err = guard
            .consume(&token, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Expired);
    }

    #[test]
    fn test_boundary_instant_is_still_valid() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 16);
        let token = guard
            .issue(30, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();
        clock.advance_secs(30);
        assert!(guard.consume(&token, TokenScope::Append, 0, clock.now()).is_ok());
    }

    #[test]
    fn test_forged_and_unknown_tokens() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 16);
        let token = guard
            .issue(60, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();

        let mut widened = token.clone();
        widened.scopes.insert(TokenScope::RotateKey);
        let err = guard
            .consume(&widened, TokenScope::RotateKey, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Unknown);

        let mut stranger = token;
        stranger.nonce = Uuid::new_v4();
        let err = guard
            .consume(&stranger, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Unknown);
    }

    #[test]
    fn test_scope_and_approvals_enforced() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 16);
        let token = guard
            .issue(
                60,
                [TokenScope::RotateKey],
                approvers(&["alice", "alice", " "]),
                clock.now(),
            )
            .unwrap();
        assert_eq!(token.approvals.len(), 1);

        let err = guard
            .consume(&token, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Unauthorized);

        let err = guard
            .consume(&token, TokenScope::RotateKey, 2, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::InsufficientApprovals);

        // Rejections do not burn the token.
        assert!(guard
            .consume(&token, TokenScope::RotateKey, 1, clock.now())
            .is_ok());
    }

    #[test]
    fn test_capacity_and_pruning() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 2);
        for _ in 0..2 {
            let t = guard
                .issue(10, [TokenScope::Append], Vec::new(), clock.now())
                .unwrap();
            guard.consume(&t, TokenScope::Append, 0, clock.now()).unwrap();
        }
        let third = guard
            .issue(100, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();
        let err = guard
            .consume(&third, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::CapacityExhausted);

        clock.advance_secs(11);
        assert!(guard.consume(&third, TokenScope::Append, 0, clock.now()).is_ok());
        assert_eq!(guard.status().consumed, 1);
    }

    #[test]
    fn test_presented_string_paths() {
        let clock = ManualClock::at_epoch();
        let guard = TokenGuard::in_memory(HashAlgorithmId::Sha256, 4);
        let err = guard
            .consume_presented(None, TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Missing);
        let err = guard
            .consume_presented(Some("not-a-token"), TokenScope::Append, 0, clock.now())
            .unwrap_err();
        assert_eq!(failure(err), TokenFailure::Malformed);

        let token = guard
            .issue(60, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();
        let encoded = token.encode().unwrap();
        assert_matches!(
            guard.consume_presented(Some(&encoded), TokenScope::Append, 0, clock.now()),
            Ok(_)
        );
    }

    #[test]
    fn test_concurrent_consumption_succeeds_once() {
        let clock = ManualClock::at_epoch();
        let guard = Arc::new(TokenGuard::in_memory(HashAlgorithmId::Sha256, 64));
        let token = guard
            .issue(60, [TokenScope::Append], Vec::new(), clock.now())
            .unwrap();
        let now = clock.now();

        let successes: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let guard = Arc::clone(&guard);
                    let token = token.clone();
                    scope.spawn(move || guard.consume(&token, TokenScope::Append, 0, now).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(successes, 1);
    }
}
