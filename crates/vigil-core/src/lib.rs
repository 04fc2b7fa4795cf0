//! Vigil Core - shared foundation for the tamper-evident ledger
//!
//! Everything above this crate depends on the pieces defined here:
//!
//! - **Canonical codec** (`codec`): total, deterministic encoding of any serde value
//! - **Hash capability** (`hash`): SHA-256 by default, BLAKE3 selectable at construction
//! - **Canonical time** (`time`): millisecond-precision UTC plus an injectable clock
//! - **Errors** (`errors`): the single [`VigilError`] taxonomy
//! - **Configuration** (`config`): TOML file, environment overlay, validation
//! - **Seams** (`crypto`, `cancel`): signer/verifier and cooperative cancellation traits
//!
//! Nothing in this crate performs I/O except `config` loading and the small
//! atomic-write helper in `persist`.

#![forbid(unsafe_code)]

/// Cooperative cancellation
pub mod cancel;

/// Canonical JSON encoding
pub mod codec;

/// Configuration loading and validation
pub mod config;

/// Signing and verification seams
pub mod crypto;

/// Unified error handling
pub mod errors;

/// Hash capability and digests
pub mod hash;

/// Atomic file persistence helpers
pub mod persist;

/// Canonical timestamps and clocks
pub mod time;

pub use cancel::{CancelFlag, CancellationToken, NeverCancel};
pub use codec::{canonical_digest, decode, encode};
pub use config::{DataPaths, IndexBackendKind, VigilConfig};
pub use crypto::{EntrySignature, KeyId, SignatureVerifier, Signer};
pub use errors::{ErrorKind, Result, Sequence, TokenFailure, VigilError};
pub use hash::{domain, Digest, HashAlgorithm, HashAlgorithmId};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
