//! Work that leaves the executor thread and comes back

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rust_deferred::{
    timer, CancellationToken, Deferred, Executor, ExecutorError, Failure, FiringState, Outcome,
    ThreadedDeferred,
};

#[test]
fn test_every_hop_settles_on_the_executor_thread() {
    common::setup_tracing();
    let executor = Executor::new();
    let origin = thread::current().id();
    let settled_on = Rc::new(RefCell::new(Vec::new()));

    let hops: Vec<_> = (0..8)
        .map(|n| {
            let hop = ThreadedDeferred::spawn(&executor, |x: usize| Ok(x + 100), n);
            let seen = settled_on.clone();
            hop.add_callback(move |v| {
                seen.borrow_mut().push(thread::current().id());
                Outcome::Value(v)
            })
            .unwrap();
            hop
        })
        .collect();
    assert_eq!(executor.pending(), 8);

    executor.run();
    assert_eq!(executor.pending(), 0);
    assert_eq!(settled_on.borrow().len(), 8);
    assert!(settled_on.borrow().iter().all(|id| *id == origin));
    for (n, hop) in hops.iter().enumerate() {
        assert_eq!(hop.result(), Some(Ok(n + 100)));
    }
}

#[test]
fn test_worker_runs_exactly_once() {
    let executor = Executor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let hop = ThreadedDeferred::spawn(
        &executor,
        move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        (),
    );
    executor.run();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(hop.state(), FiringState::Succeeded);
}

#[test]
fn test_cooperative_cancellation_reaches_worker() {
    common::setup_tracing();
    let executor = Executor::new();
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    let hop = ThreadedDeferred::spawn_cancellable(
        &executor,
        move |limit: usize, token: CancellationToken| {
            for step in 0..limit {
                if token.is_cancelled() {
                    seen.store(step, Ordering::SeqCst);
                    return Err(Failure::Cancelled);
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(limit)
        },
        10_000,
    );

    thread::sleep(Duration::from_millis(5));
    hop.cancel();
    assert_eq!(hop.result(), Some(Err(Failure::Cancelled)));

    executor.run();
    assert!(observed.load(Ordering::SeqCst) < 10_000);
    assert_eq!(hop.result(), Some(Err(Failure::Cancelled)));
}

#[test]
fn test_hop_chain_into_second_hop() {
    let executor = Executor::new();
    let first = ThreadedDeferred::spawn(&executor, |x: u32| Ok(x + 1), 1);
    let next_executor = executor.clone();
    first
        .add_callback(move |v| {
            Outcome::Nested(
                ThreadedDeferred::spawn(&next_executor, |x: u32| Ok(x * 100), v).into_deferred(),
            )
        })
        .unwrap();

    executor.run();
    assert_eq!(first.result(), Some(Ok(200)));
}

#[test]
fn test_await_inside_block_on() {
    common::setup_tracing();
    let executor = Executor::new();
    let hop_executor = executor.clone();

    let total = executor
        .block_on(async move {
            let a = ThreadedDeferred::spawn(&hop_executor, |x: i64| Ok(x * 3), 5)
                .into_deferred()
                .await?;
            let b = timer::wait(&hop_executor, Duration::from_millis(2), 7).await?;
            Ok::<_, Failure>(a + b)
        })
        .unwrap();
    assert_eq!(total.unwrap(), 22);
}

#[test]
fn test_block_on_unsettled_deferred_stalls() {
    let executor = Executor::new();
    let never = Deferred::<i32>::new();
    let result = executor.block_on(never.to_future().unwrap());
    assert_eq!(result.unwrap_err(), ExecutorError::Stalled);
}
