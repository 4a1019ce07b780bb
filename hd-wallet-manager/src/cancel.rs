//! Cooperative cancellation for long-running wallet operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, WalletError};

/// Shared stop flag, checked between indexer round trips.
///
/// Clones observe the same flag, so a UI thread can hold one copy and cancel
/// a refresh or import running elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(WalletError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_clones_share_the_flag() {
        let flag = CancellationFlag::new();
        let handle = flag.clone();
        assert!(flag.check().is_ok());

        handle.cancel();
        assert!(flag.is_cancelled());
        assert_matches!(flag.check(), Err(WalletError::Cancelled));

        flag.reset();
        assert!(!handle.is_cancelled());
    }
}
