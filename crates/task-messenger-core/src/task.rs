//! Task representation and join handles.
//!
//! A task wraps a boxed future together with the bookkeeping needed to wake
//! it: waking pushes the task onto the owning reactor's ready queue, where a
//! worker thread will poll it on its next pass.

use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use futures::task::ArcWake;
use parking_lot::Mutex;
use tracing::error;

use crate::reactor::ReactorInner;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawned coroutine owned by the reactor.
pub(crate) struct Task {
    /// `None` once the future has completed (or panicked).
    future: Mutex<Option<BoxFuture>>,
    reactor: Weak<ReactorInner>,
    /// Prevents the same task from sitting in the ready queue twice.
    queued: AtomicBool,
}

impl Task {
    pub(crate) fn new(reactor: Weak<ReactorInner>, future: BoxFuture) -> Arc<Self> {
        Arc::new(Self {
            future: Mutex::new(Some(future)),
            reactor,
            queued: AtomicBool::new(false),
        })
    }

    /// Poll the wrapped future once.
    ///
    /// A panicking future is dropped here; the panic never unwinds into the
    /// reactor loop.
    pub(crate) fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::Release);
        let waker = futures::task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => *slot = None,
            Ok(Poll::Pending) => {}
            Err(_) => {
                error!("spawned task panicked; dropping it");
                *slot = None;
            }
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        match arc_self.reactor.upgrade() {
            Some(reactor) => reactor.schedule(Arc::clone(arc_self)),
            // Reactor gone: the wake is a no-op, allow future re-wakes.
            None => arc_self.queued.store(false, Ordering::Release),
        }
    }
}

enum JoinState<T> {
    /// Nobody has awaited the handle yet.
    Idle,
    /// The handle is being awaited; wake this on completion.
    Waiting(Waker),
    /// The task finished and the value has not been claimed.
    Finished(T),
    /// The value was handed out.
    Claimed,
}

/// Handle to a spawned task's result.
///
/// Await it on another task, or call [`JoinHandle::wait`] to block the
/// current thread. Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Whether the task has produced its value.
    pub fn is_finished(&self) -> bool {
        matches!(*self.state.lock(), JoinState::Finished(_) | JoinState::Claimed)
    }

    /// Block the calling thread until the task completes.
    pub fn wait(self) -> T {
        futures::executor::block_on(self)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut guard = self.state.lock();
        match mem::replace(&mut *guard, JoinState::Claimed) {
            JoinState::Finished(value) => Poll::Ready(value),
            JoinState::Idle | JoinState::Waiting(_) => {
                *guard = JoinState::Waiting(cx.waker().clone());
                Poll::Pending
            }
            JoinState::Claimed => unreachable!("join handle polled after completion"),
        }
    }
}

/// Wrap `future` so its output is stored in a shared join state, returning
/// the erased task body and the handle observing it.
pub(crate) fn with_join_handle<F, T>(future: F) -> (BoxFuture, JoinHandle<T>)
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::new(Mutex::new(JoinState::Idle));
    let handle = JoinHandle {
        state: Arc::clone(&state),
    };
    let body = async move {
        let value = future.await;
        let mut guard = state.lock();
        if let JoinState::Waiting(waker) = mem::replace(&mut *guard, JoinState::Finished(value)) {
            waker.wake();
        }
    };
    (Box::pin(body), handle)
}
