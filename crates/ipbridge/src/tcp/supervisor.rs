//! Per-connection tracking of in-flight operations.
//!
//! Every asynchronous operation a connection issues (its upstream write
//! calls) runs under the connection's [`TaskSupervisor`]. The first failure
//! of any tracked operation trips the connection's [`ReadAbort`], which makes
//! the upstream read loop stop; later failures are only logged. Failures
//! never cross connection boundaries: each connection owns its supervisor.

use ipbridge_core::BridgeResult;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One-way abort signal for a connection's local read side.
///
/// The flag moves from `false` to `true` exactly once; the transition is a
/// compare-and-set so concurrent triggers elect a single winner.
#[derive(Debug, Default)]
pub struct ReadAbort {
    aborted: AtomicBool,
    notify: Notify,
}

impl ReadAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the read side. Returns `true` only for the call that performed
    /// the transition.
    pub fn trigger(&self) -> bool {
        let won = self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Resolves once the read side has been aborted (immediately if it
    /// already has been).
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent trigger
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks a connection's spawned operations and aborts its read side on the
/// first failure.
pub struct TaskSupervisor {
    conn_id: u64,
    abort: Arc<ReadAbort>,
    tasks: JoinSet<()>,
    failures: Arc<AtomicUsize>,
}

impl TaskSupervisor {
    /// Create a supervisor whose failure action is `abort.trigger()`.
    pub fn new(conn_id: u64, abort: Arc<ReadAbort>) -> Self {
        Self {
            conn_id,
            abort,
            tasks: JoinSet::new(),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The abort signal this supervisor trips.
    pub fn abort(&self) -> &Arc<ReadAbort> {
        &self.abort
    }

    /// Track `op`, holding `guard` until the outcome has been handled.
    ///
    /// On failure the abort is triggered *before* `guard` is dropped, so
    /// anything waiting on the guard's release observes the abort.
    pub fn spawn_guarded<G, F>(&mut self, what: &'static str, guard: G, op: F)
    where
        G: Send + 'static,
        F: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        self.reap();

        let conn_id = self.conn_id;
        let abort = self.abort.clone();
        let failures = self.failures.clone();
        self.tasks.spawn(async move {
            if let Err(e) = op.await {
                failures.fetch_add(1, Ordering::Relaxed);
                if abort.trigger() {
                    warn!(conn_id, op = what, error = %e, "operation failed, aborting local reads");
                } else {
                    debug!(conn_id, op = what, error = %e, "operation failed after abort");
                }
            }
            drop(guard);
        });
    }

    /// Number of tracked operations that have not been joined yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Number of tracked operations that failed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every tracked operation to finish.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            self.on_joined(result);
        }
    }

    /// Collect already-finished tasks so the set does not grow unbounded.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.on_joined(result);
        }
    }

    fn on_joined(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if self.abort.trigger() {
                warn!(conn_id = self.conn_id, error = %e, "tracked task panicked, aborting local reads");
            }
        }
    }
}
