//! Deferred results and their callback chains
//!
//! A [`Deferred`] starts out not fired. A producer settles it exactly once
//! with a value or a [`Failure`]; from then on every link in its chain runs
//! synchronously, in order, with the result of the link before it.
//!
//! ## Firing
//!
//! The link slot that runs is chosen by the current state: the success slot
//! for a value, the failure slot for a failure. A missing slot passes the
//! result through. A capability that returns [`Outcome::Failure`] or panics
//! switches the chain to the failed state; an errback that returns
//! [`Outcome::Value`] switches it back. Returning [`Outcome::Nested`] pauses
//! the chain until the nested deferred fires, at which point its result is
//! copied in and processing resumes.
//!
//! ## Ownership
//!
//! Handles are `Rc` based and therefore `!Send`. All chain mutation happens
//! on the thread that created the deferred; background work goes through
//! [`ThreadedDeferred`](crate::ThreadedDeferred).

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::error::{DeferredError, Failure};
use crate::id::DeferredId;

/// What a capability hands back to the chain
pub enum Outcome<T: 'static> {
    /// Continue in the succeeded state with this value
    Value(T),
    /// Pause until this deferred fires, then continue with its result
    Nested(Deferred<T>),
    /// Continue in the failed state
    Failure(Failure),
}

impl<T: 'static> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}

impl<T: 'static> From<Deferred<T>> for Outcome<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Outcome::Nested(deferred)
    }
}

impl<T: 'static> From<Failure> for Outcome<T> {
    fn from(failure: Failure) -> Self {
        Outcome::Failure(failure)
    }
}

/// Firing state of a deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringState {
    NotFired,
    Succeeded,
    Failed,
}

fn state_of<T>(result: &Result<T, Failure>) -> FiringState {
    match result {
        Ok(_) => FiringState::Succeeded,
        Err(_) => FiringState::Failed,
    }
}

type Callback<T> = Box<dyn FnOnce(T) -> Outcome<T>>;
type Errback<T> = Box<dyn FnOnce(Failure) -> Outcome<T>>;
type BothFn<T> = Box<dyn FnOnce(Result<T, Failure>) -> Outcome<T>>;
type Canceller<T> = Box<dyn FnOnce(&Resolver<T>)>;
type Finalizer<T> = Box<dyn FnOnce(Option<&Result<T, Failure>>)>;
type UnhandledHook = Box<dyn FnOnce(&Failure)>;

/// Crate-internal link that sees the raw result and decides what the
/// following links get
pub(crate) type Observer<T> = Box<dyn FnOnce(Result<T, Failure>) -> Result<T, Failure>>;
/// Crate-internal last link: the result leaves this chain for good
type Handoff<T> = Box<dyn FnOnce(Result<T, Failure>)>;

enum Link<T: 'static> {
    Pair {
        on_success: Option<Callback<T>>,
        on_failure: Option<Errback<T>>,
    },
    Both(BothFn<T>),
    Observe(Observer<T>),
    Handoff(Handoff<T>),
}

struct Inner<T: 'static> {
    id: DeferredId,
    state: FiringState,
    paused: usize,
    result: Option<Result<T, Failure>>,
    chain: VecDeque<Link<T>>,
    canceller: Option<Canceller<T>>,
    finalizer: Option<Finalizer<T>>,
    unhandled: Option<UnhandledHook>,
    /// The nested deferred this one is paused on, for cancellation
    awaiting: Option<Weak<RefCell<Inner<T>>>>,
    chained: bool,
    /// A handoff link is queued; nothing may be appended after it
    handed_off: bool,
    finalized: bool,
    silently_cancelled: bool,
    /// Swallow the one settlement a producer makes after a silent cancel
    suppress_late_settle: bool,
    running: bool,
}

impl<T: 'static> Inner<T> {
    fn new(canceller: Option<Canceller<T>>) -> Self {
        Self {
            id: DeferredId::next(),
            state: FiringState::NotFired,
            paused: 0,
            result: None,
            chain: VecDeque::new(),
            canceller,
            finalizer: None,
            unhandled: None,
            awaiting: None,
            chained: false,
            handed_off: false,
            finalized: false,
            silently_cancelled: false,
            suppress_late_settle: false,
            running: false,
        }
    }
}

impl<T: 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(Err(failure)) = self.result.take() {
            tracing::debug!(deferred = %self.id, %failure, "deferred dropped with an unhandled failure");
            if let Some(hook) = self.unhandled.take() {
                hook(&failure);
            }
        }
    }
}

/// A result that may not exist yet, plus the chain that will consume it
pub struct Deferred<T: 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Deferred")
                .field("id", &inner.id)
                .field("state", &inner.state)
                .field("paused", &inner.paused)
                .field("links", &inner.chain.len())
                .field("chained", &inner.chained)
                .field("finalized", &inner.finalized)
                .finish(),
            Err(_) => f.debug_struct("Deferred").field("inner", &"<firing>").finish(),
        }
    }
}

impl<T: 'static> Deferred<T> {
    /// Create a deferred that has not fired
    pub fn new() -> Self {
        Self::from_inner(Inner::new(None))
    }

    /// Create a deferred with a canceller
    ///
    /// The canceller runs on [`cancel`](Self::cancel) while the deferred is
    /// still unfired and conventionally errbacks it through the resolver it
    /// is handed. If it does not, the deferred is errbacked with
    /// [`Failure::Cancelled`] afterwards.
    pub fn with_canceller<C>(canceller: C) -> Self
    where
        C: FnOnce(&Resolver<T>) + 'static,
    {
        Self::from_inner(Inner::new(Some(Box::new(canceller))))
    }

    /// Create a deferred together with the producer's settlement handle
    pub fn pair() -> (Self, Resolver<T>) {
        let deferred = Self::new();
        let resolver = deferred.resolver();
        (deferred, resolver)
    }

    /// A deferred that has already succeeded with `value`
    pub fn succeed(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(Ok(value));
        deferred
    }

    /// A deferred that has already failed with `failure`
    pub fn fail(failure: Failure) -> Self {
        let deferred = Self::new();
        deferred.resolve(Err(failure));
        deferred
    }

    fn from_inner(inner: Inner<T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// The producer-side settlement handle for this deferred
    ///
    /// Unlike [`callback`](Self::callback), a resolver can still settle the
    /// deferred after it has been returned from another chain's capability.
    pub fn resolver(&self) -> Resolver<T> {
        Resolver {
            deferred: self.clone(),
        }
    }

    pub fn id(&self) -> DeferredId {
        self.inner.borrow().id
    }

    pub fn state(&self) -> FiringState {
        self.inner.borrow().state
    }

    /// Number of nested deferreds the chain is waiting on
    pub fn paused(&self) -> usize {
        self.inner.borrow().paused
    }

    pub fn is_fired(&self) -> bool {
        self.state() != FiringState::NotFired
    }

    /// True once this deferred has been returned from another deferred's
    /// capability and belongs to that chain
    pub fn is_chained(&self) -> bool {
        self.inner.borrow().chained
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.borrow().finalized
    }

    pub fn was_silently_cancelled(&self) -> bool {
        self.inner.borrow().silently_cancelled
    }

    /// Whether a current result is held (it is gone once handed to a
    /// parent chain, an absorbing list, or an awaiting future)
    pub fn has_result(&self) -> bool {
        self.inner.borrow().result.is_some()
    }

    /// A copy of the current result
    pub fn result(&self) -> Option<Result<T, Failure>>
    where
        T: Clone,
    {
        self.inner.borrow().result.clone()
    }

    /// Append a success capability; failures pass it by
    pub fn add_callback<F>(&self, on_success: F) -> Result<&Self, DeferredError>
    where
        F: FnOnce(T) -> Outcome<T> + 'static,
    {
        self.append(Link::Pair {
            on_success: Some(Box::new(on_success)),
            on_failure: None,
        })
    }

    /// Append a failure capability; values pass it by
    pub fn add_errback<G>(&self, on_failure: G) -> Result<&Self, DeferredError>
    where
        G: FnOnce(Failure) -> Outcome<T> + 'static,
    {
        self.append(Link::Pair {
            on_success: None,
            on_failure: Some(Box::new(on_failure)),
        })
    }

    /// Append one link with both slots filled
    pub fn add_callbacks<F, G>(&self, on_success: F, on_failure: G) -> Result<&Self, DeferredError>
    where
        F: FnOnce(T) -> Outcome<T> + 'static,
        G: FnOnce(Failure) -> Outcome<T> + 'static,
    {
        self.append(Link::Pair {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        })
    }

    /// Append a capability that runs whatever the current state is
    pub fn add_both<F>(&self, on_either: F) -> Result<&Self, DeferredError>
    where
        F: FnOnce(Result<T, Failure>) -> Outcome<T> + 'static,
    {
        self.append(Link::Both(Box::new(on_either)))
    }

    pub(crate) fn add_observer<F>(&self, observer: F) -> Result<(), DeferredError>
    where
        F: FnOnce(Result<T, Failure>) -> Result<T, Failure> + 'static,
    {
        self.append(Link::Observe(Box::new(observer))).map(|_| ())
    }

    /// Append the link that takes the result out of this chain
    ///
    /// Later appends fail with [`DeferredError::HandedOff`].
    pub(crate) fn add_handoff<F>(&self, handoff: F) -> Result<(), DeferredError>
    where
        F: FnOnce(Result<T, Failure>) + 'static,
    {
        self.append(Link::Handoff(Box::new(handoff))).map(|_| ())
    }

    /// Run `finalizer` once the deferred has fired and its chain is drained
    ///
    /// After the finalizer runs the deferred is finalized: no more links can
    /// be added and it can not be settled again.
    pub fn set_finalizer<F>(&self, finalizer: F) -> Result<(), DeferredError>
    where
        F: FnOnce(Option<&Result<T, Failure>>) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.finalized {
                return Err(DeferredError::Finalized(inner.id));
            }
            inner.finalizer = Some(Box::new(finalizer));
        }
        self.maybe_finalize();
        Ok(())
    }

    /// Observe a failure nobody handled
    ///
    /// `hook` runs when the last handle is dropped while the current result
    /// is still a failure.
    pub fn on_unhandled_failure<F>(&self, hook: F)
    where
        F: FnOnce(&Failure) + 'static,
    {
        self.inner.borrow_mut().unhandled = Some(Box::new(hook));
    }

    /// Settle with a value
    pub fn callback(&self, value: T) -> Result<(), DeferredError> {
        self.settle(Ok(value), true)
    }

    /// Settle with a failure
    pub fn errback(&self, failure: Failure) -> Result<(), DeferredError> {
        self.settle(Err(failure), true)
    }

    /// Cancel the deferred
    ///
    /// An unfired deferred runs its canceller, or without one is marked
    /// silently cancelled; either way it ends up fired. A deferred paused
    /// on a nested deferred cancels that one instead.
    pub fn cancel(&self) {
        let (id, state, canceller, awaiting) = {
            let mut inner = self.inner.borrow_mut();
            let canceller = if inner.state == FiringState::NotFired {
                inner.canceller.take()
            } else {
                None
            };
            (inner.id, inner.state, canceller, inner.awaiting.clone())
        };

        if state != FiringState::NotFired {
            if let Some(nested) = awaiting.and_then(|weak| weak.upgrade()) {
                tracing::debug!(deferred = %id, "cancelling the deferred this chain is paused on");
                Deferred { inner: nested }.cancel();
            }
            return;
        }

        match canceller {
            Some(canceller) => {
                tracing::debug!(deferred = %id, "running canceller");
                canceller(&self.resolver());
            }
            None => {
                tracing::debug!(deferred = %id, "cancelled without a canceller");
                let mut inner = self.inner.borrow_mut();
                inner.silently_cancelled = true;
                inner.suppress_late_settle = true;
            }
        }

        if !self.is_fired() {
            self.resolve(Err(Failure::Cancelled));
        }
    }

    /// Hand the result to a new deferred of another type
    ///
    /// The value goes through `f`; failures pass through as they are. The
    /// result is moved out of this deferred, so no links can be added to it
    /// afterwards.
    pub fn map_into<U, F>(&self, f: F) -> Result<Deferred<U>, DeferredError>
    where
        U: 'static,
        F: FnOnce(T) -> Result<U, Failure> + 'static,
    {
        let (target, resolver) = Deferred::<U>::pair();
        let id = self.id();
        self.add_handoff(move |result| {
            let mapped = match result {
                Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                    Ok(mapped) => mapped,
                    Err(payload) => Err(Failure::Panicked(panic_message(payload.as_ref()))),
                },
                Err(failure) => Err(failure),
            };
            if let Err(error) = resolver.settle(mapped) {
                tracing::warn!(deferred = %id, %error, "mapped deferred was already settled");
            }
        })?;
        Ok(target)
    }

    /// Whether links can still be appended to this deferred
    pub(crate) fn check_appendable(&self) -> Result<(), DeferredError> {
        let inner = self.inner.borrow();
        if inner.finalized {
            return Err(DeferredError::Finalized(inner.id));
        }
        if inner.chained {
            return Err(DeferredError::ChainOrigin(inner.id));
        }
        if inner.handed_off {
            return Err(DeferredError::HandedOff(inner.id));
        }
        Ok(())
    }

    fn append(&self, link: Link<T>) -> Result<&Self, DeferredError> {
        self.check_appendable()?;
        self.push_link(link);
        Ok(self)
    }

    fn push_link(&self, link: Link<T>) {
        let fired = {
            let mut inner = self.inner.borrow_mut();
            if matches!(link, Link::Handoff(_)) {
                inner.handed_off = true;
            }
            inner.chain.push_back(link);
            inner.state != FiringState::NotFired
        };
        if fired {
            self.fire();
        }
    }

    fn settle(&self, result: Result<T, Failure>, external: bool) -> Result<(), DeferredError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.finalized {
                return Err(DeferredError::Finalized(inner.id));
            }
            if external && inner.chained {
                return Err(DeferredError::ChainOrigin(inner.id));
            }
            if inner.state != FiringState::NotFired {
                if inner.suppress_late_settle {
                    inner.suppress_late_settle = false;
                    tracing::debug!(deferred = %inner.id, "ignoring settlement of a cancelled deferred");
                    return Ok(());
                }
                return Err(DeferredError::AlreadyFired(inner.id));
            }
            inner.state = state_of(&result);
            inner.result = Some(result);
            tracing::trace!(deferred = %inner.id, state = ?inner.state, "settled");
        }
        self.fire();
        Ok(())
    }

    /// Settle from inside the crate, bypassing the chained check
    pub(crate) fn resolve(&self, result: Result<T, Failure>) {
        if let Err(error) = self.settle(result, false) {
            tracing::warn!(%error, "dropping settlement");
        }
    }

    fn fire(&self) {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.running {
                return;
            }
            inner.running = true;
            inner.id
        };

        loop {
            let (link, result) = {
                let mut inner = self.inner.borrow_mut();
                if inner.paused > 0 {
                    break;
                }
                // Without a result the remaining links wait; only a handoff
                // empties the slot and nothing can be queued after one
                let Some(result) = inner.result.take() else {
                    break;
                };
                let Some(link) = inner.chain.pop_front() else {
                    inner.result = Some(result);
                    break;
                };
                (link, result)
            };

            let outcome = match (link, result) {
                (
                    Link::Pair {
                        on_success: Some(f),
                        ..
                    },
                    Ok(value),
                ) => invoke(id, move || f(value)),
                (
                    Link::Pair {
                        on_failure: Some(g),
                        ..
                    },
                    Err(failure),
                ) => invoke(id, move || g(failure)),
                (Link::Pair { .. }, passed) => Outcome::from(passed),
                (Link::Both(f), result) => invoke(id, move || f(result)),
                (Link::Observe(observe), result) => {
                    let kept = observe(result);
                    let mut inner = self.inner.borrow_mut();
                    inner.state = state_of(&kept);
                    inner.result = Some(kept);
                    continue;
                }
                (Link::Handoff(take), result) => {
                    tracing::trace!(deferred = %id, "result handed off");
                    take(result);
                    continue;
                }
            };

            self.apply(id, outcome);
        }

        self.inner.borrow_mut().running = false;
        self.maybe_finalize();
    }

    fn apply(&self, id: DeferredId, outcome: Outcome<T>) {
        let result = match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
            Outcome::Nested(nested) => match self.claim(&nested) {
                Ok(()) => {
                    self.pause_on(nested);
                    return;
                }
                Err(error) => {
                    tracing::warn!(deferred = %id, %error, "capability returned an unusable deferred");
                    Err(Failure::Misuse(error))
                }
            },
        };
        let mut inner = self.inner.borrow_mut();
        inner.state = state_of(&result);
        inner.result = Some(result);
    }

    /// Mark `nested` as owned by this chain
    fn claim(&self, nested: &Deferred<T>) -> Result<(), DeferredError> {
        if Rc::ptr_eq(&self.inner, &nested.inner) {
            return Err(DeferredError::SelfChain(self.id()));
        }
        let mut inner = nested.inner.borrow_mut();
        if inner.chained {
            return Err(DeferredError::AlreadyChained(inner.id));
        }
        if inner.finalized {
            return Err(DeferredError::Finalized(inner.id));
        }
        if inner.handed_off {
            return Err(DeferredError::HandedOff(inner.id));
        }
        inner.chained = true;
        Ok(())
    }

    fn pause_on(&self, nested: Deferred<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.paused += 1;
            inner.awaiting = Some(Rc::downgrade(&nested.inner));
            tracing::trace!(deferred = %inner.id, nested = %nested.id(), "paused");
        }
        let parent = self.clone();
        nested.push_link(Link::Handoff(Box::new(move |result| {
            parent.resume(result);
        })));
    }

    fn resume(&self, result: Result<T, Failure>) {
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.paused > 0, "resumed a deferred that was not paused");
            inner.paused = inner.paused.saturating_sub(1);
            inner.awaiting = None;
            inner.state = state_of(&result);
            inner.result = Some(result);
            tracing::trace!(deferred = %inner.id, state = ?inner.state, "resumed");
        }
        self.fire();
    }

    fn maybe_finalize(&self) {
        let (id, finalizer, result) = {
            let mut inner = self.inner.borrow_mut();
            if inner.finalized
                || inner.running
                || inner.paused > 0
                || inner.state == FiringState::NotFired
                || !inner.chain.is_empty()
            {
                return;
            }
            let Some(finalizer) = inner.finalizer.take() else {
                return;
            };
            inner.finalized = true;
            (inner.id, finalizer, inner.result.take())
        };
        tracing::debug!(deferred = %id, "finalizing");
        finalizer(result.as_ref());
        self.inner.borrow_mut().result = result;
    }
}

/// Producer-side settlement handle for a [`Deferred`]
///
/// Producers keep a resolver when the deferred they hand out may be
/// returned from somebody's capability before it is settled.
pub struct Resolver<T: 'static> {
    deferred: Deferred<T>,
}

impl<T: 'static> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            deferred: self.deferred.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl<T: 'static> Resolver<T> {
    pub fn callback(&self, value: T) -> Result<(), DeferredError> {
        self.settle(Ok(value))
    }

    pub fn errback(&self, failure: Failure) -> Result<(), DeferredError> {
        self.settle(Err(failure))
    }

    pub fn settle(&self, result: Result<T, Failure>) -> Result<(), DeferredError> {
        self.deferred.settle(result, false)
    }

    pub fn is_fired(&self) -> bool {
        self.deferred.is_fired()
    }

    /// The deferred this resolver settles
    pub fn deferred(&self) -> Deferred<T> {
        self.deferred.clone()
    }
}

/// Call `f` with `arg` and wrap whatever comes back in a deferred
///
/// A returned deferred is passed on as is; a value or failure (including a
/// panic) becomes an already-fired deferred.
pub fn maybe_deferred<T, A, F>(f: F, arg: A) -> Deferred<T>
where
    T: 'static,
    F: FnOnce(A) -> Outcome<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(arg))) {
        Ok(Outcome::Value(value)) => Deferred::succeed(value),
        Ok(Outcome::Failure(failure)) => Deferred::fail(failure),
        Ok(Outcome::Nested(deferred)) => deferred,
        Err(payload) => Deferred::fail(Failure::Panicked(panic_message(payload.as_ref()))),
    }
}

fn invoke<T, F>(id: DeferredId, f: F) -> Outcome<T>
where
    T: 'static,
    F: FnOnce() -> Outcome<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::debug!(deferred = %id, %message, "capability panicked");
            Outcome::Failure(Failure::Panicked(message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
