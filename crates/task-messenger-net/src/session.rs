//! Dispatch sessions: one coroutine per accepted worker connection.
//!
//! A session pulls messages from the shared pool, writes each framed
//! request, reads the framed response, and forwards it to the application
//! sink. The first I/O failure (or pool shutdown) closes the socket and
//! ends the coroutine; sockets are single-use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use task_messenger_core::{Reactor, WorkGuard};
use tracing::{debug, error, warn};

use crate::error::{Result, TransportError};
use crate::pool::TaskPool;
use crate::socket::{OverlayStream, SocketAdapter};
use crate::state::SessionState;
use crate::wire::{HEADER_SIZE, ProtocolLimits, TaskMessage};

/// Destination for completed task responses.
pub trait ResponseSink: Send + Sync {
    /// Called once per response, with the echoed task id and the payload.
    fn deliver(&self, task_id: u32, payload: Bytes);
}

impl<F> ResponseSink for F
where
    F: Fn(u32, Bytes) + Send + Sync,
{
    fn deliver(&self, task_id: u32, payload: Bytes) {
        self(task_id, payload)
    }
}

/// Unique identifier for a dispatch session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Byte and task counters for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    /// Completed request/response exchanges.
    pub tasks: u64,
    /// Protocol bytes received (headers + bodies).
    pub bytes_in: u64,
    /// Protocol bytes sent.
    pub bytes_out: u64,
}

/// One accepted worker connection and its coroutine's accounting.
pub struct Session {
    id: SessionId,
    adapter: SocketAdapter,
    state: Mutex<SessionState>,
    tasks: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    completed: AtomicBool,
}

impl Session {
    fn new(adapter: SocketAdapter) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            adapter,
            state: Mutex::new(SessionState::Open),
            tasks: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        })
    }

    /// The session's unique id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state of the session loop.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The socket this session drives.
    pub fn adapter(&self) -> &SocketAdapter {
        &self.adapter
    }

    /// Whether the coroutine has exited.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Snapshot of the session's counters.
    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            tasks: self.tasks.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// One request/response exchange with the connected worker.
async fn exchange(
    session: &Session,
    message: TaskMessage,
    sink: &dyn ResponseSink,
    limits: ProtocolLimits,
) -> Result<()> {
    session.set_state(SessionState::Sending);
    let sent = session.adapter.write_message(&message).await?;
    session.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);

    session.set_state(SessionState::Receiving);
    let header = session.adapter.read_header().await?;
    limits.check(&header)?;
    let body = session.adapter.read_exact(header.body_size as usize).await?;
    session
        .bytes_in
        .fetch_add((HEADER_SIZE + body.len()) as u64, Ordering::Relaxed);

    sink.deliver(header.task_id, body);
    session.tasks.fetch_add(1, Ordering::Relaxed);
    session.set_state(SessionState::Open);
    Ok(())
}

async fn run_session(
    session: Arc<Session>,
    pool: Arc<TaskPool>,
    sink: Arc<dyn ResponseSink>,
    limits: ProtocolLimits,
) {
    debug!(session = %session.id, peer = ?session.adapter.peer_addr(), "session started");
    loop {
        let message = pool.get_next().await;
        if !message.is_valid() {
            debug!(session = %session.id, "pool shut down; closing session");
            break;
        }
        let task_id = message.header().task_id;
        let queued_for = message.age();
        if let Err(err) = exchange(&session, message, &*sink, limits).await {
            match err {
                TransportError::ConnectionClosed => {
                    debug!(session = %session.id, task_id, "connection closed; task lost on this session");
                }
                TransportError::Protocol(ref msg) => {
                    error!(session = %session.id, task_id, violation = %msg, "protocol violation; terminating session");
                }
                ref err => {
                    warn!(session = %session.id, task_id, error = %err, "session I/O failed; task lost on this session");
                }
            }
            break;
        }
        tracing::trace!(session = %session.id, task_id, queued_ms = queued_for.as_millis() as u64, "task completed");
    }
    session.adapter.close();
    session.set_state(SessionState::Closed);
    session.completed.store(true, Ordering::Release);
    debug!(session = %session.id, metrics = ?session.metrics(), "session finished");
}

/// Aggregate counters across live and reaped sessions, plus pool depth.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchStats {
    /// Sessions whose coroutine has not yet exited.
    pub live_sessions: usize,
    /// Completed exchanges across all sessions, ever.
    pub tasks_completed: u64,
    /// Protocol bytes received across all sessions, ever.
    pub bytes_in: u64,
    /// Protocol bytes sent across all sessions, ever.
    pub bytes_out: u64,
    /// Messages currently queued in the pool.
    pub pool_depth: usize,
    /// Sessions currently suspended on the pool.
    pub pool_waiters: usize,
}

/// Owns the set of live sessions and the shared task pool.
pub struct SessionManager {
    reactor: Reactor,
    pool: Arc<TaskPool>,
    sink: Arc<dyn ResponseSink>,
    limits: ProtocolLimits,
    sessions: Mutex<Vec<Arc<Session>>>,
    reaped_tasks: AtomicU64,
    reaped_bytes_in: AtomicU64,
    reaped_bytes_out: AtomicU64,
    reaped_count: AtomicUsize,
    work_guard: Mutex<Option<WorkGuard>>,
}

impl SessionManager {
    /// Create a manager. Holds a reactor work guard until
    /// [`shutdown`](Self::shutdown) so suspended sessions stay pollable.
    pub fn new(
        reactor: Reactor,
        pool: Arc<TaskPool>,
        sink: Arc<dyn ResponseSink>,
        limits: ProtocolLimits,
    ) -> Arc<Self> {
        let work_guard = reactor.make_work_guard();
        Arc::new(Self {
            reactor,
            pool,
            sink,
            limits,
            sessions: Mutex::new(Vec::new()),
            reaped_tasks: AtomicU64::new(0),
            reaped_bytes_in: AtomicU64::new(0),
            reaped_bytes_out: AtomicU64::new(0),
            reaped_count: AtomicUsize::new(0),
            work_guard: Mutex::new(Some(work_guard)),
        })
    }

    /// Wrap an accepted stream in a session and spawn its coroutine.
    pub fn create_session(&self, stream: Box<dyn OverlayStream>) -> Arc<Session> {
        let adapter = SocketAdapter::from_stream(self.reactor.clone(), stream);
        let session = Session::new(adapter);
        self.sessions.lock().push(Arc::clone(&session));
        // Detached: completion is observed through the session itself.
        let _ = self.reactor.spawn(run_session(
            Arc::clone(&session),
            Arc::clone(&self.pool),
            Arc::clone(&self.sink),
            self.limits,
        ));
        session
    }

    /// Hand a batch of tasks to the pool, preserving order.
    pub fn enqueue_tasks(&self, tasks: Vec<TaskMessage>) -> Result<()> {
        self.pool.add_batch(tasks)
    }

    /// The shared task pool.
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Number of sessions not yet reaped.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove sessions whose coroutines have exited, folding their
    /// counters into the aggregate. Returns how many were reaped.
    pub fn cleanup_completed_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|session| {
            if session.is_completed() {
                let metrics = session.metrics();
                self.reaped_tasks.fetch_add(metrics.tasks, Ordering::Relaxed);
                self.reaped_bytes_in
                    .fetch_add(metrics.bytes_in, Ordering::Relaxed);
                self.reaped_bytes_out
                    .fetch_add(metrics.bytes_out, Ordering::Relaxed);
                self.reaped_count.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
        before - sessions.len()
    }

    /// Aggregate statistics across live and reaped sessions.
    pub fn stats(&self) -> DispatchStats {
        let mut stats = DispatchStats {
            live_sessions: 0,
            tasks_completed: self.reaped_tasks.load(Ordering::Relaxed),
            bytes_in: self.reaped_bytes_in.load(Ordering::Relaxed),
            bytes_out: self.reaped_bytes_out.load(Ordering::Relaxed),
            pool_depth: self.pool.len(),
            pool_waiters: self.pool.waiting_count(),
        };
        for session in self.sessions.lock().iter() {
            let metrics = session.metrics();
            stats.tasks_completed += metrics.tasks;
            stats.bytes_in += metrics.bytes_in;
            stats.bytes_out += metrics.bytes_out;
            if !session.is_completed() {
                stats.live_sessions += 1;
            }
        }
        stats
    }

    /// Shut down: stop the pool (waking suspended sessions with the
    /// sentinel), close every session socket, and release the reactor
    /// work guard.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        for session in self.sessions.lock().iter() {
            session.adapter().close();
        }
        self.work_guard.lock().take();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .field("pool_depth", &self.pool.len())
            .finish()
    }
}
