//! Configuration constants for the executor and its worker threads

/// How long a blocking executor wait sleeps on the ready channel (in milliseconds)
///
/// `run` and `block_on` wake up at least this often to re-check whether any
/// hop is still outstanding. Deliveries themselves wake the wait immediately.
pub const EXECUTOR_POLL_TIMEOUT_MS: u64 = 10;

/// Name prefix for worker threads spawned by thread hops
///
/// Threads are named `{prefix}-{hop id}`, which shows up in panics and
/// debuggers.
pub const WORKER_THREAD_PREFIX: &str = "deferred-hop";
