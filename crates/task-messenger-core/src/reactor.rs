//! Cooperative event loop over registered pending operations.
//!
//! The reactor owns two queues: *pending operations*, the `(try_complete,
//! waker)` pairs registered by suspended awaitables, and *ready tasks*,
//! coroutines scheduled for a poll. Worker threads alternate between
//! evaluating every pending operation once and draining the ready queue,
//! sleeping on a condition variable with a bounded timeout (the poll
//! interval) when a pass makes no progress.
//!
//! The reactor is an injected dependency: construct one, `start` it, hand
//! clones to whatever needs to register I/O or spawn coroutines, and `stop`
//! it on the way out. A [`WorkGuard`] keeps worker threads alive across
//! moments where no operation happens to be registered.

use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Waker;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Result, RuntimeError};
use crate::stats::{CompletionStats, OpCategory, ReactorStats};
use crate::task::{JoinHandle, Task, with_join_handle};

/// Default bounded wait between passes over not-ready operations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after a panic reaches a worker thread's root.
const PASS_PANIC_BACKOFF: Duration = Duration::from_millis(50);

struct PendingOp {
    category: OpCategory,
    try_complete: Box<dyn FnMut() -> bool + Send>,
    waker: Waker,
    attempts: u32,
}

struct LoopState {
    pending: VecDeque<PendingOp>,
    ready: VecDeque<Arc<Task>>,
}

pub(crate) struct ReactorInner {
    state: Mutex<LoopState>,
    cond: Condvar,
    running: AtomicBool,
    outstanding_work: AtomicUsize,
    stats: CompletionStats,
    poll_interval: Duration,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ReactorInner {
    pub(crate) fn schedule(&self, task: Arc<Task>) {
        self.state.lock().ready.push_back(task);
        self.cond.notify_one();
    }
}

/// Handle to a cooperative I/O reactor.
///
/// Cheap to clone; all clones refer to the same loop. See the module
/// documentation for the operating model.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Create a reactor with the default poll interval.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a reactor with a custom poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                state: Mutex::new(LoopState {
                    pending: VecDeque::new(),
                    ready: VecDeque::new(),
                }),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                outstanding_work: AtomicUsize::new(0),
                stats: CompletionStats::new(),
                poll_interval,
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start `threads` worker threads (at least one).
    ///
    /// Calling `start` on an already-started reactor is a no-op.
    pub fn start(&self, threads: usize) -> Result<()> {
        let threads = threads.max(1);
        let mut slots = self.inner.threads.lock();
        if !slots.is_empty() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        self.inner.stats.ensure_thread_slots(threads);
        for index in 0..threads {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("tm-io-{index}"))
                .spawn(move || worker_loop(inner, index))
                .map_err(RuntimeError::ThreadSpawn)?;
            slots.push(handle);
        }
        debug!(threads, "reactor started");
        Ok(())
    }

    /// Stop the reactor: clear the running flag, wake every worker, join
    /// them. Idempotent; must not be called from a worker thread.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("reactor worker thread panicked during shutdown");
            }
        }
    }

    /// Whether worker threads are (supposed to be) running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Register a pending operation.
    ///
    /// `try_complete` is evaluated once per pass on a worker thread until it
    /// returns `true`, at which point `waker` is woken. It must attempt its
    /// non-blocking syscall and report readiness; errors are communicated by
    /// storing them where the awaitable can see them and returning `true`.
    pub fn register_pending<F>(&self, category: OpCategory, try_complete: F, waker: Waker)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let op = PendingOp {
            category,
            try_complete: Box::new(try_complete),
            waker,
            attempts: 0,
        };
        self.inner.state.lock().pending.push_back(op);
        self.inner.cond.notify_one();
    }

    /// Spawn a coroutine onto the reactor.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (body, handle) = with_join_handle(future);
        let task = Task::new(Arc::downgrade(&self.inner), body);
        self.inner.schedule(task);
        handle
    }

    /// Keep worker threads alive while the guard exists, even with no
    /// pending operations or ready tasks.
    pub fn make_work_guard(&self) -> WorkGuard {
        self.inner.outstanding_work.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of operations currently registered.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Snapshot of completion accounting.
    pub fn stats(&self) -> ReactorStats {
        self.inner.stats.snapshot()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Keeps the reactor loop alive while held. Released on drop.
pub struct WorkGuard {
    inner: Arc<ReactorInner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.cond.notify_all();
        }
    }
}

fn worker_loop(inner: Arc<ReactorInner>, index: usize) {
    debug!(thread = index, "reactor worker running");
    while inner.running.load(Ordering::Acquire) {
        let progressed = match panic::catch_unwind(AssertUnwindSafe(|| run_pass(&inner, index))) {
            Ok(progressed) => progressed,
            Err(_) => {
                error!(thread = index, "reactor pass panicked; continuing");
                thread::sleep(PASS_PANIC_BACKOFF);
                continue;
            }
        };
        if progressed {
            continue;
        }
        let mut state = inner.state.lock();
        if state.ready.is_empty() {
            if state.pending.is_empty() && inner.outstanding_work.load(Ordering::Acquire) == 0 {
                // Out of work entirely; let the thread retire.
                break;
            }
            let _ = inner.cond.wait_for(&mut state, inner.poll_interval);
        }
    }
    debug!(thread = index, "reactor worker exiting");
}

/// One pass: evaluate every pending operation once, wake the completed
/// ones, then drain the ready queue. Returns whether anything progressed.
fn run_pass(inner: &ReactorInner, index: usize) -> bool {
    let ops = mem::take(&mut inner.state.lock().pending);
    let mut kept = VecDeque::with_capacity(ops.len());
    let mut completed: Vec<Waker> = Vec::new();
    for mut op in ops {
        match panic::catch_unwind(AssertUnwindSafe(|| (op.try_complete)())) {
            Ok(true) => {
                inner.stats.record_completion(op.category, op.attempts, index);
                completed.push(op.waker);
            }
            Ok(false) => {
                op.attempts = op.attempts.saturating_add(1);
                kept.push_back(op);
            }
            Err(_) => {
                error!(category = %op.category, "pending operation panicked; dropping it");
                inner.stats.record_dropped();
                completed.push(op.waker);
            }
        }
    }
    {
        // Operations registered while we were evaluating landed in the
        // (empty) pending queue; keep registration order by putting the
        // survivors first.
        let mut state = inner.state.lock();
        let newly_registered = mem::take(&mut state.pending);
        state.pending = kept;
        state.pending.extend(newly_registered);
    }
    let completed_any = !completed.is_empty();
    for waker in completed {
        waker.wake();
    }

    let mut polled_any = false;
    loop {
        let task = inner.state.lock().ready.pop_front();
        let Some(task) = task else { break };
        task.run();
        polled_any = true;
    }
    completed_any || polled_any
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn noop_waker() -> Waker {
        futures::task::noop_waker()
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let reactor = Reactor::new();
        reactor.start(2).unwrap();
        reactor.start(4).unwrap();
        reactor.stop();
        reactor.stop();
        assert!(!reactor.is_running());
    }

    #[test]
    fn pending_op_completes_and_counts_attempts() {
        let reactor = Reactor::new();
        let _guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        let polls = Arc::new(AtomicU32::new(0));
        let polls_clone = Arc::clone(&polls);
        reactor.register_pending(
            OpCategory::Read,
            move || polls_clone.fetch_add(1, Ordering::SeqCst) >= 2,
            noop_waker(),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while reactor.stats().ops_completed == 0 {
            assert!(Instant::now() < deadline, "operation never completed");
            thread::sleep(Duration::from_millis(5));
        }

        let stats = reactor.stats();
        assert_eq!(stats.ops_completed, 1);
        assert_eq!(stats.failure_attempts.samples, 1);
        assert!(stats.failure_attempts.max >= 2);
        assert_eq!(reactor.pending_count(), 0);
        reactor.stop();
    }

    #[test]
    fn panicking_op_is_dropped_not_propagated() {
        let reactor = Reactor::new();
        let _guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        reactor.register_pending(OpCategory::Write, || panic!("boom"), noop_waker());

        let deadline = Instant::now() + Duration::from_secs(2);
        while reactor.stats().ops_dropped == 0 {
            assert!(Instant::now() < deadline, "panicking op never dropped");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(reactor.is_running());
        reactor.stop();
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let reactor = Reactor::new();
        let _guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        let handle = reactor.spawn(async { 7 * 6 });
        assert_eq!(handle.wait(), 42);
        reactor.stop();
    }

    #[test]
    fn workers_retire_without_outstanding_work() {
        let reactor = Reactor::new();
        let guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        let handle = reactor.spawn(async { "done" });
        assert_eq!(handle.wait(), "done");

        // Dropping the last guard lets the worker exit on its own.
        drop(guard);
        thread::sleep(Duration::from_millis(100));
        reactor.stop();
    }
}
