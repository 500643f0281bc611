//! The task message pool bridging producers to suspended sessions.
//!
//! A single mutex guards two FIFO queues: ready messages and waiters. At
//! most one of the two is non-empty at any observable moment: a producer
//! that finds a waiter hands its message over directly (the message never
//! touches the queue), and a consumer that finds a message takes it without
//! suspending. Wakes are always issued after the mutex is released.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::wire::TaskMessage;

/// Result slot shared between a suspended consumer and the pool for the
/// duration of the suspension.
struct WaiterSlot {
    message: Mutex<Option<TaskMessage>>,
    waker: Mutex<Option<Waker>>,
}

impl WaiterSlot {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            message: Mutex::new(None),
            waker: Mutex::new(Some(waker)),
        })
    }

    fn fill(&self, message: TaskMessage) {
        *self.message.lock() = Some(message);
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

struct PoolInner {
    queue: VecDeque<TaskMessage>,
    waiters: VecDeque<Arc<WaiterSlot>>,
    shut_down: bool,
}

/// Awaitable FIFO queue of task messages shared across sessions.
pub struct TaskPool {
    inner: Mutex<PoolInner>,
}

impl TaskPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
                shut_down: false,
            }),
        }
    }

    /// Take the next message, suspending until one is produced.
    ///
    /// Completes immediately when a message is queued. After
    /// [`shutdown`](Self::shutdown) it completes with the invalid sentinel;
    /// callers are expected to exit on `!msg.is_valid()`.
    pub fn get_next(&self) -> GetNext<'_> {
        GetNext {
            pool: self,
            slot: None,
        }
    }

    /// Enqueue one message, or hand it directly to the oldest waiter.
    ///
    /// The matched waiter is woken only after the pool mutex has been
    /// released. Rejects messages after shutdown and the invalid sentinel.
    pub fn add(&self, message: TaskMessage) -> Result<()> {
        if !message.is_valid() {
            return Err(TransportError::Protocol(
                "cannot enqueue a message with task id 0".into(),
            ));
        }
        let matched = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return Err(TransportError::PoolShutdown);
            }
            match inner.waiters.pop_front() {
                Some(slot) => {
                    slot.fill(message);
                    Some(slot)
                }
                None => {
                    inner.queue.push_back(message);
                    None
                }
            }
        };
        if let Some(slot) = matched {
            slot.wake();
        }
        Ok(())
    }

    /// Enqueue a batch, preserving insertion order.
    ///
    /// Each message runs the single-add path; the lock is reacquired per
    /// message, so waiters resume one at a time in FIFO order.
    pub fn add_batch(&self, messages: Vec<TaskMessage>) -> Result<()> {
        for message in messages {
            self.add(message)?;
        }
        Ok(())
    }

    /// Shut the pool down: refuse new messages and resume every suspended
    /// waiter with the invalid sentinel.
    pub fn shutdown(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            std::mem::take(&mut inner.waiters)
        };
        debug!(waiters = waiters.len(), "task pool shutting down");
        for slot in waiters {
            slot.wake();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Number of suspended consumers.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable returned by [`TaskPool::get_next`].
pub struct GetNext<'a> {
    pool: &'a TaskPool,
    slot: Option<Arc<WaiterSlot>>,
}

impl Future for GetNext<'_> {
    type Output = TaskMessage;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskMessage> {
        let this = &mut *self;
        if let Some(slot) = &this.slot {
            let taken = slot.message.lock().take();
            if let Some(message) = taken {
                this.slot = None;
                return Poll::Ready(message);
            }
            if this.pool.inner.lock().shut_down {
                this.slot = None;
                return Poll::Ready(TaskMessage::invalid());
            }
            // Spurious wake: refresh the stored waker and keep waiting.
            *slot.waker.lock() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut inner = this.pool.inner.lock();
        if inner.shut_down {
            return Poll::Ready(TaskMessage::invalid());
        }
        if let Some(message) = inner.queue.pop_front() {
            // Fast path: no suspension.
            return Poll::Ready(message);
        }
        let slot = WaiterSlot::new(cx.waker().clone());
        inner.waiters.push_back(Arc::clone(&slot));
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl Drop for GetNext<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        // Deregister, and return any message that raced into our slot to
        // the front of the queue so it is not lost.
        let mut inner = self.pool.inner.lock();
        inner.waiters.retain(|other| !Arc::ptr_eq(other, &slot));
        if let Some(message) = slot.message.lock().take()
            && !inner.shut_down
        {
            inner.queue.push_front(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::task::noop_waker;

    fn msg(task_id: u32) -> TaskMessage {
        TaskMessage::new(task_id, 1, format!("payload-{task_id}")).unwrap()
    }

    #[test]
    fn fast_path_skips_suspension() {
        let pool = TaskPool::new();
        pool.add(msg(1)).unwrap();
        let got = block_on(pool.get_next());
        assert_eq!(got.header().task_id, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn messages_are_fifo() {
        let pool = TaskPool::new();
        pool.add_batch(vec![msg(1), msg(2), msg(3)]).unwrap();
        assert_eq!(pool.len(), 3);
        for expected in 1..=3 {
            assert_eq!(block_on(pool.get_next()).header().task_id, expected);
        }
    }

    #[test]
    fn waiter_receives_message_directly() {
        let pool = Arc::new(TaskPool::new());
        let consumer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || block_on(pool.get_next()))
        };
        // Wait for the consumer to suspend before producing.
        while pool.waiting_count() == 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        pool.add(msg(7)).unwrap();
        let got = consumer.join().unwrap();
        assert_eq!(got.header().task_id, 7);
        // The message bypassed the queue entirely.
        assert!(pool.is_empty());
    }

    #[test]
    fn shutdown_resumes_waiters_with_sentinel() {
        let pool = Arc::new(TaskPool::new());
        let consumers: Vec<_> = (0..5)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || block_on(pool.get_next()))
            })
            .collect();
        while pool.waiting_count() < 5 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        pool.shutdown();
        for consumer in consumers {
            assert!(!consumer.join().unwrap().is_valid());
        }
        assert_eq!(pool.waiting_count(), 0);
    }

    #[test]
    fn add_after_shutdown_is_rejected() {
        let pool = TaskPool::new();
        pool.shutdown();
        assert!(matches!(
            pool.add(msg(1)),
            Err(TransportError::PoolShutdown)
        ));
        assert!(!block_on(pool.get_next()).is_valid());
    }

    #[test]
    fn sentinel_cannot_be_enqueued() {
        let pool = TaskPool::new();
        assert!(pool.add(TaskMessage::invalid()).is_err());
    }

    #[test]
    fn cancelled_waiter_does_not_lose_a_message() {
        let pool = TaskPool::new();
        {
            let mut pending = pool.get_next();
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut pending).poll(&mut cx).is_pending());
            assert_eq!(pool.waiting_count(), 1);
            // Fill the waiter's slot, then drop the future before it is
            // polled again.
            pool.add(msg(9)).unwrap();
        }
        assert_eq!(pool.waiting_count(), 0);
        assert_eq!(pool.len(), 1);
        assert_eq!(block_on(pool.get_next()).header().task_id, 9);
    }
}
