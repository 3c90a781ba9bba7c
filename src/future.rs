//! Awaiting a deferred
//!
//! [`DeferredFuture`] is the `std::future::Future` side of a deferred: it
//! sits at the end of the chain, takes the result when the chain reaches it
//! and wakes whoever is polling.

use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::deferred::Deferred;
use crate::error::{DeferredError, Failure};

/// A future that completes with a deferred's result
pub struct DeferredFuture<T> {
    shared: Rc<RefCell<SharedState<T>>>,
}

/// State shared between the future and the chain observer
struct SharedState<T> {
    completed: bool,
    result: Option<Result<T, Failure>>,
    waker: Option<Waker>,
}

impl<T> DeferredFuture<T> {
    fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(SharedState {
                completed: false,
                result: None,
                waker: None,
            })),
        }
    }

    fn ready(result: Result<T, Failure>) -> Self {
        let future = Self::new();
        {
            let mut shared = future.shared.borrow_mut();
            shared.completed = true;
            shared.result = Some(result);
        }
        future
    }

    /// Check if the result has arrived without polling
    pub fn is_ready(&self) -> bool {
        self.shared.borrow().completed
    }
}

impl<T> Future for DeferredFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();

        if shared.completed {
            let result = shared
                .result
                .take()
                .expect("DeferredFuture polled after completion");
            Poll::Ready(result)
        } else {
            shared.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T: 'static> Deferred<T> {
    /// Append a link that moves the result into a future
    ///
    /// The result leaves the chain: adding links afterwards fails with
    /// [`DeferredError::HandedOff`].
    pub fn to_future(&self) -> Result<DeferredFuture<T>, DeferredError> {
        let future = DeferredFuture::new();
        let shared = future.shared.clone();
        self.add_handoff(move |result| {
            let waker = {
                let mut shared = shared.borrow_mut();
                shared.completed = true;
                shared.result = Some(result);
                shared.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        })?;
        Ok(future)
    }
}

impl<T: 'static> IntoFuture for Deferred<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = DeferredFuture<T>;

    /// A deferred that can not be observed any more resolves to
    /// [`Failure::Misuse`]
    fn into_future(self) -> Self::IntoFuture {
        self.to_future()
            .unwrap_or_else(|error| DeferredFuture::ready(Err(Failure::Misuse(error))))
    }
}
