//! Identifiers
//!
//! Deferreds and thread hops carry small numeric ids so that errors and
//! log events can name the instance they are about.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static DEFERRED_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredId(u64);

impl DeferredId {
    /// Generates a new unique DeferredId
    pub(crate) fn next() -> Self {
        DeferredId(DEFERRED_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one pending hand-off registered with an [`Executor`](crate::Executor)
///
/// Ids are only unique within the executor that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HopId(pub(crate) u64);

impl fmt::Display for HopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hop-{}", self.0)
    }
}
