//! Cooperative cancellation for background work
//!
//! Cancelling a [`ThreadedDeferred`](crate::ThreadedDeferred) settles its
//! deferred right away, but the worker thread keeps running until it looks
//! at its token. Workers that can stop early should check it periodically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Failure;

/// A token that can be used to signal cancellation to a worker
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new cancellation token
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the token
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Failure::Cancelled)` once cancellation has been requested, so a
    /// worker can bail out with `?`
    pub fn check(&self) -> Result<(), Failure> {
        if self.is_cancelled() {
            Err(Failure::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let worker_side = token.clone();
        assert!(!worker_side.is_cancelled());
        assert!(worker_side.check().is_ok());

        token.cancel();
        assert!(worker_side.is_cancelled());
        assert!(matches!(worker_side.check(), Err(Failure::Cancelled)));
    }
}
