//! Deferreds that fire after a delay
//!
//! Both factories sleep on a worker thread through a [`ThreadedDeferred`],
//! so the executor thread never blocks and the deferred still fires on it.

use std::thread;
use std::time::Duration;

use crate::deferred::Deferred;
use crate::error::Failure;
use crate::executor::Executor;
use crate::threaded::ThreadedDeferred;

/// A deferred that succeeds with `value` once `delay` has passed
///
/// Cancelling it before then fails it with [`Failure::Cancelled`]; the
/// sleeping worker is abandoned and its result dropped.
pub fn wait<T>(executor: &Executor, delay: Duration, value: T) -> Deferred<T>
where
    T: Send + 'static,
{
    tracing::trace!(?delay, "starting wait");
    ThreadedDeferred::spawn_cancellable(
        executor,
        move |value, token| {
            thread::sleep(delay);
            token.check()?;
            Ok(value)
        },
        value,
    )
    .into_deferred()
}

/// Run `func` on the executor thread once `delay` has passed
///
/// Only the sleep happens in the background; `func` may therefore touch
/// other deferreds owned by the executor.
pub fn call_later<T, F>(executor: &Executor, delay: Duration, func: F) -> Deferred<T>
where
    T: 'static,
    F: FnOnce() -> Result<T, Failure> + 'static,
{
    let timer = wait(executor, delay, ());
    match timer.map_into(move |()| func()) {
        Ok(deferred) => deferred,
        Err(error) => Deferred::fail(error.into()),
    }
}
