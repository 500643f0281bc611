//! Integration tests driving hand-rolled awaitables through the reactor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use task_messenger_core::{OpCategory, Reactor};

/// Completes after its pending operation has been polled `countdown`
/// times, the way a socket awaitable completes after enough passes.
struct ReadyAfter {
    reactor: Reactor,
    countdown: Arc<AtomicU32>,
    complete: Arc<AtomicBool>,
    registered: bool,
}

impl ReadyAfter {
    fn new(reactor: Reactor, passes: u32) -> Self {
        Self {
            reactor,
            countdown: Arc::new(AtomicU32::new(passes)),
            complete: Arc::new(AtomicBool::new(false)),
            registered: false,
        }
    }
}

impl Future for ReadyAfter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.complete.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if !self.registered {
            self.registered = true;
            let countdown = Arc::clone(&self.countdown);
            let complete = Arc::clone(&self.complete);
            self.reactor.register_pending(
                OpCategory::Read,
                move || {
                    if countdown.fetch_sub(1, Ordering::SeqCst) <= 1 {
                        complete.store(true, Ordering::Release);
                        true
                    } else {
                        false
                    }
                },
                cx.waker().clone(),
            );
        }
        Poll::Pending
    }
}

#[test]
fn suspended_task_resumes_when_its_op_completes() {
    let reactor = Reactor::new();
    let _guard = reactor.make_work_guard();
    reactor.start(2).unwrap();

    let awaitable = ReadyAfter::new(reactor.clone(), 3);
    let handle = reactor.spawn(async move {
        awaitable.await;
        "resumed"
    });
    assert_eq!(handle.wait(), "resumed");

    let stats = reactor.stats();
    assert_eq!(stats.ops_completed, 1);
    assert_eq!(stats.histogram(OpCategory::Read).iter().sum::<u64>(), 1);
    assert!(stats.failure_attempts.max >= 1);
    reactor.stop();
}

#[test]
fn work_guard_keeps_reactor_alive_across_idle_gaps() {
    let reactor = Reactor::new();
    let guard = reactor.make_work_guard();
    reactor.start(1).unwrap();

    assert_eq!(reactor.spawn(async { 1 }).wait(), 1);

    // Long enough that an unguarded worker would have retired.
    thread::sleep(Duration::from_millis(200));

    assert_eq!(reactor.spawn(async { 2 }).wait(), 2);

    drop(guard);
    reactor.stop();
}

#[test]
fn tasks_can_spawn_further_tasks() {
    let reactor = Reactor::new();
    let _guard = reactor.make_work_guard();
    reactor.start(1).unwrap();

    let inner_reactor = reactor.clone();
    let handle = reactor.spawn(async move {
        let inner = inner_reactor.spawn(async { 21 });
        inner.await * 2
    });
    assert_eq!(handle.wait(), 42);
    reactor.stop();
}
