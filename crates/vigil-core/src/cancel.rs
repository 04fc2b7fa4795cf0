//! Cooperative cancellation for long-running scans and replays.

use crate::errors::{Result, VigilError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token.
pub trait CancellationToken: Send + Sync {
    /// Non-blocking cancellation check.
    fn is_cancelled(&self) -> bool;

    /// Fail with `Cancelled` if cancellation was requested.
    fn checkpoint(&self, location: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(VigilError::cancelled(format!("stopped at {location}")))
        } else {
            Ok(())
        }
    }
}

/// Cancellation token that never triggers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancel;

impl CancellationToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared flag, cloned into every job that should observe it.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancellationToken for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(observer.checkpoint("segment 0").is_ok());
        flag.cancel();
        let err = observer.checkpoint("segment 1").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
        assert!(!NeverCancel.is_cancelled());
    }
}
