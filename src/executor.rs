//! The originating context for thread hops
//!
//! An [`Executor`] is the thread that owns a set of deferreds. Background
//! work started through it runs on its own worker thread, but the result is
//! always handed back here before it touches a chain:
//!
//! 1. `spawn_hop` registers a delivery closure under a fresh [`HopId`] and
//!    starts one named worker thread
//! 2. the worker sends its result on a one-shot channel, then posts the hop
//!    id on the executor's ready channel
//! 3. `tick`, `run`, `run_until_fired` or `block_on` pick the id up on the
//!    executor thread and run the delivery closure, which settles the
//!    deferred
//!
//! The handle is `Rc` based, so it can not leave the thread it was created
//! on; deliveries therefore can not happen anywhere else.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::{EXECUTOR_POLL_TIMEOUT_MS, WORKER_THREAD_PREFIX};
use crate::deferred::Deferred;
use crate::error::ExecutorError;
use crate::id::HopId;

type Delivery = Box<dyn FnOnce()>;

/// Single-threaded delivery loop for thread hops
#[derive(Clone)]
pub struct Executor {
    shared: Rc<Shared>,
}

struct Shared {
    pending: RefCell<HashMap<HopId, Delivery>>,
    next_hop: Cell<u64>,
    ready_tx: Sender<HopId>,
    ready_rx: Receiver<HopId>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let undelivered = self.pending.get_mut().len();
        if undelivered > 0 {
            tracing::debug!(undelivered, "executor dropped with hops still outstanding");
        }
    }
}

/// Posts the hop id when the worker finishes, even if it unwinds
struct ReadyGuard {
    hop: HopId,
    ready_tx: Sender<HopId>,
}

impl Drop for ReadyGuard {
    fn drop(&mut self) {
        // The executor may be gone; then nobody is waiting.
        let _ = self.ready_tx.send(self.hop);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Create an executor owned by the current thread
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Rc::new(Shared {
                pending: RefCell::new(HashMap::new()),
                next_hop: Cell::new(1),
                ready_tx,
                ready_rx,
            }),
        }
    }

    /// Number of hops whose result has not been delivered yet
    pub fn pending(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    fn next_hop_id(&self) -> HopId {
        let id = self.shared.next_hop.get();
        self.shared.next_hop.set(id + 1);
        HopId(id)
    }

    /// Run `work` on a new worker thread and hand its result to `deliver`
    /// on this executor's thread
    ///
    /// `deliver` receives `None` if the worker ended without producing a
    /// result.
    pub(crate) fn spawn_hop<R, W, D>(&self, work: W, deliver: D) -> std::io::Result<HopId>
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static,
        D: FnOnce(Option<R>) + 'static,
    {
        let hop = self.next_hop_id();
        let (result_tx, result_rx) = crossbeam_channel::bounded::<R>(1);
        self.shared
            .pending
            .borrow_mut()
            .insert(hop, Box::new(move || deliver(result_rx.try_recv().ok())));

        let ready_tx = self.shared.ready_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", WORKER_THREAD_PREFIX, hop.0))
            .spawn(move || {
                let _ready = ReadyGuard { hop, ready_tx };
                let result = work();
                let _ = result_tx.send(result);
            });

        match spawned {
            Ok(_) => {
                tracing::debug!(%hop, "worker thread spawned");
                Ok(hop)
            }
            Err(e) => {
                tracing::error!(%hop, "failed to spawn worker thread: {}", e);
                self.shared.pending.borrow_mut().remove(&hop);
                Err(e)
            }
        }
    }

    fn deliver(&self, hop: HopId) -> bool {
        let delivery = self.shared.pending.borrow_mut().remove(&hop);
        match delivery {
            Some(delivery) => {
                tracing::trace!(%hop, "delivering hop result");
                delivery();
                true
            }
            None => {
                tracing::warn!(%hop, "ready notification for an unknown hop");
                false
            }
        }
    }

    /// Deliver every hop whose worker has already reported
    ///
    /// Never blocks. Returns the number of deliveries made.
    pub fn tick(&self) -> usize {
        let mut delivered = 0;
        while let Ok(hop) = self.shared.ready_rx.try_recv() {
            if self.deliver(hop) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Wait up to one poll interval for a delivery
    fn wait_once(&self) -> usize {
        let timeout = Duration::from_millis(EXECUTOR_POLL_TIMEOUT_MS);
        match self.shared.ready_rx.recv_timeout(timeout) {
            Ok(hop) => usize::from(self.deliver(hop)) + self.tick(),
            Err(RecvTimeoutError::Timeout) => 0,
            // We hold a sender ourselves, so this can not happen
            Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Block until no hop is outstanding
    ///
    /// Hops registered by callbacks during delivery are waited for too.
    pub fn run(&self) {
        tracing::debug!(pending = self.pending(), "executor running");
        self.tick();
        while self.pending() > 0 {
            self.wait_once();
        }
    }

    /// Block until `deferred` has fired
    pub fn run_until_fired<T: 'static>(&self, deferred: &Deferred<T>) -> Result<(), ExecutorError> {
        loop {
            self.tick();
            if deferred.is_fired() {
                return Ok(());
            }
            if self.pending() == 0 {
                return Err(ExecutorError::Stalled);
            }
            self.wait_once();
        }
    }

    /// Drive `future` to completion, delivering hops in between polls
    ///
    /// Fails with [`ExecutorError::Stalled`] when the future is pending and
    /// no outstanding hop could ever wake it.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, ExecutorError>
    where
        F: Future,
    {
        let mut future = std::pin::pin!(future);
        let waker = futures::task::noop_waker();
        let mut context = Context::from_waker(&waker);

        loop {
            self.tick();
            if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
                return Ok(output);
            }
            if self.pending() == 0 {
                return Err(ExecutorError::Stalled);
            }
            self.wait_once();
        }
    }
}
