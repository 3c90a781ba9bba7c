#![no_main]
use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rust_deferred::{Deferred, DeferredList, Failure, FiringState, Outcome};

#[derive(Arbitrary, Debug)]
enum Op {
    Callback(u8, i32),
    Errback(u8),
    Cancel(u8),
    AddCallback(u8, i32),
    AddErrback(u8, i32),
    Nest(u8, u8),
    Finalize(u8),
}

// Drives random operations over a small pool of deferreds and checks that
// misuse is always reported as an error rather than corrupting state.
fuzz_target!(|input: (u8, Vec<Op>)| {
    let (size, ops) = input;
    let pool: Vec<Deferred<i32>> = (0..1 + size as usize % 8).map(|_| Deferred::new()).collect();
    let list = DeferredList::new(pool.clone()).ok();
    let pick = |i: u8| &pool[i as usize % pool.len()];

    for op in ops.into_iter().take(256) {
        match op {
            Op::Callback(i, v) => {
                let _ = pick(i).callback(v);
            }
            Op::Errback(i) => {
                let _ = pick(i).errback(Failure::msg("fuzz"));
            }
            Op::Cancel(i) => pick(i).cancel(),
            Op::AddCallback(i, n) => {
                let _ = pick(i).add_callback(move |v| Outcome::Value(v.wrapping_add(n)));
            }
            Op::AddErrback(i, n) => {
                let _ = pick(i).add_errback(move |_| Outcome::Value(n));
            }
            Op::Nest(i, j) => {
                let nested = pick(j).clone();
                let _ = pick(i).add_callback(move |_| Outcome::Nested(nested));
            }
            Op::Finalize(i) => {
                let _ = pick(i).set_finalizer(|_| {});
            }
        }
    }

    for d in &pool {
        if d.is_finalized() {
            assert!(d.callback(0).is_err());
        }
        if d.paused() == 0 && d.state() == FiringState::NotFired {
            assert!(d.result().is_none());
        }
    }
    if let Some(list) = list {
        assert!(list.finished_count() <= list.len());
    }
});
