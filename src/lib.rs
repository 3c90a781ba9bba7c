//! rust-deferred: results that arrive later, and the chains that consume them
//!
//! This crate provides a callback-chain deferred in the Twisted/MochiKit
//! tradition, built for single-threaded event loops:
//!
//! - [`Deferred`] holds a result that may not exist yet together with an
//!   ordered chain of success/failure capabilities to run once it does
//! - [`DeferredList`] fans many deferreds into one
//! - [`ThreadedDeferred`] runs a closure on a worker thread and settles its
//!   deferred back on the thread that owns the [`Executor`]
//! - [`DeferredFuture`] lets a deferred be `.await`ed
//!
//! ## Chains
//!
//! Every link is a pair of optional capabilities. The success slot runs when
//! the current result is a value, the failure slot when it is a [`Failure`].
//! A missing slot passes the result through untouched. A capability can
//! return a plain value, a failure, or another deferred, in which case the
//! chain pauses until that deferred fires.
//!
//! ```rust
//! use rust_deferred::{Deferred, Failure, Outcome};
//!
//! # fn main() -> Result<(), rust_deferred::error::DeferredError> {
//! let d = Deferred::<i32>::new();
//! d.add_callback(|v| Outcome::Value(v + 1))?
//!     .add_callback(|v| {
//!         if v > 10 {
//!             Outcome::Failure(Failure::msg("too large"))
//!         } else {
//!             Outcome::Value(v)
//!         }
//!     })?
//!     .add_errback(|_| Outcome::Value(10))?;
//!
//! d.callback(41)?;
//! assert_eq!(d.result().map(|r| r.ok()), Some(Some(10)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Background work
//!
//! ```rust,no_run
//! use rust_deferred::{Executor, ThreadedDeferred};
//!
//! let executor = Executor::new();
//! let hop = ThreadedDeferred::spawn(&executor, |x: u64| Ok(x * 2), 21);
//! executor.run();
//! assert_eq!(hop.result().and_then(|r| r.ok()), Some(42));
//! ```

#![deny(warnings)]

pub mod cancellation;
pub mod config;
pub mod deferred;
pub mod executor;
pub mod future;
pub mod id;
pub mod list;
pub mod threaded;
pub mod timer;

// Re-export core types
pub use cancellation::CancellationToken;
pub use deferred::{maybe_deferred, Deferred, FiringState, Outcome, Resolver};
pub use error::{DeferredError, ExecutorError, Failure};
pub use executor::Executor;
pub use future::DeferredFuture;
pub use id::{DeferredId, HopId};
pub use list::{gather_results, DeferredList, ListBuilder, ListResult};
pub use threaded::ThreadedDeferred;

/// Error types for the deferred engine
pub mod error {
    use std::sync::Arc;

    use thiserror::Error;

    use crate::id::DeferredId;

    /// Contract violations reported straight back to the offending caller
    ///
    /// These never enter a chain as data; they mean the calling code broke
    /// the settle-once / single-owner rules.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DeferredError {
        #[error("deferred {0} has already fired")]
        AlreadyFired(DeferredId),

        #[error("finalized deferred {0} can not be re-used")]
        Finalized(DeferredId),

        #[error("deferred {0} is chained and can only be driven by the chain that owns it")]
        ChainOrigin(DeferredId),

        #[error("deferred {0} is already chained to another deferred")]
        AlreadyChained(DeferredId),

        #[error("deferred {0} can not wait on itself")]
        SelfChain(DeferredId),

        #[error("result of deferred {0} was handed off; no links can follow")]
        HandedOff(DeferredId),
    }

    impl DeferredError {
        /// True for the two reuse violations: settling twice or touching a
        /// finalized deferred
        pub fn is_reuse(&self) -> bool {
            matches!(self, Self::AlreadyFired(_) | Self::Finalized(_))
        }

        /// The deferred the violation was detected on
        pub fn deferred_id(&self) -> DeferredId {
            match self {
                Self::AlreadyFired(id)
                | Self::Finalized(id)
                | Self::ChainOrigin(id)
                | Self::AlreadyChained(id)
                | Self::SelfChain(id)
                | Self::HandedOff(id) => *id,
            }
        }
    }

    /// The failure payload carried through a chain in the failed state
    #[derive(Error, Debug, Clone)]
    pub enum Failure {
        #[error("deferred was cancelled")]
        Cancelled,

        #[error("{0}")]
        Message(String),

        #[error("capability panicked: {0}")]
        Panicked(String),

        #[error("deferred at index {index} failed: {cause}")]
        FirstError { index: usize, cause: Box<Failure> },

        #[error("deferred contract violated: {0}")]
        Misuse(#[from] DeferredError),

        #[error("{0}")]
        External(Arc<dyn std::error::Error + Send + Sync>),
    }

    impl Failure {
        /// A failure carrying only a message
        pub fn msg(message: impl Into<String>) -> Self {
            Self::Message(message.into())
        }

        /// Wrap any error type
        pub fn new<E>(error: E) -> Self
        where
            E: std::error::Error + Send + Sync + 'static,
        {
            Self::External(Arc::new(error))
        }

        /// Whether this failure came from a cancellation
        pub fn is_cancelled(&self) -> bool {
            matches!(self, Self::Cancelled)
        }
    }

    // External errors have no equality of their own; compare their messages.
    impl PartialEq for Failure {
        fn eq(&self, other: &Self) -> bool {
            match (self, other) {
                (Self::Cancelled, Self::Cancelled) => true,
                (Self::Message(a), Self::Message(b)) | (Self::Panicked(a), Self::Panicked(b)) => a == b,
                (
                    Self::FirstError { index: a, cause: x },
                    Self::FirstError { index: b, cause: y },
                ) => a == b && x == y,
                (Self::Misuse(a), Self::Misuse(b)) => a == b,
                (Self::External(a), Self::External(b)) => a.to_string() == b.to_string(),
                _ => false,
            }
        }
    }

    impl From<std::io::Error> for Failure {
        fn from(error: std::io::Error) -> Self {
            Self::new(error)
        }
    }

    /// Errors raised by the [`Executor`](crate::Executor) itself
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ExecutorError {
        #[error("future is pending but no thread hop is outstanding to wake it")]
        Stalled,
    }
}
