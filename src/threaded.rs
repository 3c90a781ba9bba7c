//! Running a capability on a background thread
//!
//! A [`ThreadedDeferred`] is a deferred whose producer is a worker thread.
//! The worker only ever sees the closure, its argument and a one-shot
//! sender; the deferred itself stays on the executor's thread, where the
//! result is delivered and exactly one of callback/errback fires.

use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use crate::cancellation::CancellationToken;
use crate::deferred::{panic_message, Deferred, Resolver};
use crate::error::Failure;
use crate::executor::Executor;
use crate::id::HopId;

/// A deferred settled by work running on another thread
pub struct ThreadedDeferred<T: 'static> {
    deferred: Deferred<T>,
    hop: Option<HopId>,
    token: CancellationToken,
    origin: ThreadId,
}

impl<T: Send + 'static> ThreadedDeferred<T> {
    /// Run `func(arg)` on a worker thread
    ///
    /// If the thread can not be spawned the deferred comes back already
    /// failed with the spawn error.
    pub fn spawn<A, F>(executor: &Executor, func: F, arg: A) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A) -> Result<T, Failure> + Send + 'static,
    {
        Self::spawn_cancellable(executor, move |arg, _token| func(arg), arg)
    }

    /// Like [`spawn`](Self::spawn), but `func` also receives the token that
    /// cancelling the deferred trips
    pub fn spawn_cancellable<A, F>(executor: &Executor, func: F, arg: A) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A, CancellationToken) -> Result<T, Failure> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel_token = token.clone();
        let deferred = Deferred::with_canceller(move |_: &Resolver<T>| cancel_token.cancel());
        let id = deferred.id();

        let worker_token = token.clone();
        let work = move || match panic::catch_unwind(AssertUnwindSafe(|| func(arg, worker_token))) {
            Ok(result) => result,
            Err(payload) => Err(Failure::Panicked(panic_message(payload.as_ref()))),
        };

        let resolver = deferred.resolver();
        let delivery_token = token.clone();
        let deliver = move |result: Option<Result<T, Failure>>| {
            if delivery_token.is_cancelled() && resolver.is_fired() {
                tracing::debug!(deferred = %id, "dropping result of a cancelled hop");
                return;
            }
            let result = result
                .unwrap_or_else(|| Err(Failure::msg("worker thread exited without a result")));
            if let Err(error) = resolver.settle(result) {
                tracing::warn!(deferred = %id, %error, "could not deliver hop result");
            }
        };

        let hop = match executor.spawn_hop(work, deliver) {
            Ok(hop) => {
                tracing::debug!(deferred = %id, %hop, "threaded deferred started");
                Some(hop)
            }
            Err(e) => {
                deferred.resolve(Err(Failure::from(e)));
                None
            }
        };

        Self {
            deferred,
            hop,
            token,
            origin: thread::current().id(),
        }
    }
}

impl<T: 'static> ThreadedDeferred<T> {
    /// The hop carrying the result back, `None` if no worker was started
    pub fn hop(&self) -> Option<HopId> {
        self.hop
    }

    /// The thread the result will be delivered on
    pub fn origin_thread(&self) -> ThreadId {
        self.origin
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }

    pub fn into_deferred(self) -> Deferred<T> {
        self.deferred
    }
}

impl<T: 'static> Deref for ThreadedDeferred<T> {
    type Target = Deferred<T>;

    fn deref(&self) -> &Self::Target {
        &self.deferred
    }
}

impl<T: 'static> fmt::Debug for ThreadedDeferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedDeferred")
            .field("deferred", &self.deferred)
            .field("hop", &self.hop)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
