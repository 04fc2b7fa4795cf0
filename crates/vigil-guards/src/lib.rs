#![forbid(unsafe_code)]
//! # Vigil Guards - governance token enforcement
//!
//! A [`GovernanceToken`] is a short-lived, single-use credential. The
//! [`TokenGuard`] issues tokens, remembers which nonces have been consumed
//! (bounded and persisted) and hands out a [`ConsumedGrant`] that every
//! mutating ledger operation must present. Because the grant can only be
//! constructed by a successful `consume`, the type system enforces that no
//! write happens without clearing the guard first.

pub mod guard;
pub mod token;

pub use guard::{ConsumedGrant, GuardStatus, TokenGuard};
pub use token::{GovernanceToken, TokenScope};
