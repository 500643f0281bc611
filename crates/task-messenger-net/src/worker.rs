//! Worker runtime: the peer-side mirror of the dispatch session.
//!
//! The runtime reads framed requests, hands each to the skill dispatcher,
//! and writes the framed response back. Two strategies share one adapter
//! and one accounting surface: the blocking variant runs the loop on the
//! calling thread, the async variant runs it as a reactor coroutine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use task_messenger_core::Reactor;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::socket::{SocketAdapter, SocketFactory};
use crate::state::WorkerState;
use crate::wire::{ProtocolLimits, TaskMessage};

/// Maps a `skill_id` to an executable handler. The transport never
/// interprets payloads.
pub trait SkillDispatcher: Send + Sync {
    /// Execute one task and produce the response payload.
    fn dispatch(&self, task_id: u32, skill_id: u32, payload: Bytes) -> Bytes;
}

impl<F> SkillDispatcher for F
where
    F: Fn(u32, u32, Bytes) -> Bytes + Send + Sync,
{
    fn dispatch(&self, task_id: u32, skill_id: u32, payload: Bytes) -> Bytes {
        self(task_id, skill_id, payload)
    }
}

/// Why a `run` call returned without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The manager closed the connection (or `shutdown` was requested).
    Finished,
    /// A pause was requested; `run` may be called again.
    Paused,
}

/// Options for the worker runtime.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Manager address.
    pub manager_host: String,
    /// Manager port.
    pub manager_port: u16,
    /// Bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Framing limits applied to received headers.
    pub limits: ProtocolLimits,
}

impl WorkerOptions {
    /// Create options targeting the given manager.
    pub fn new(manager_host: impl Into<String>, manager_port: u16) -> Self {
        Self {
            manager_host: manager_host.into(),
            manager_port,
            connect_timeout: Duration::from_secs(10),
            limits: ProtocolLimits::default(),
        }
    }

    /// Set the per-attempt connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the framing limits.
    pub fn limits(mut self, limits: ProtocolLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// The worker-side task loop.
///
/// One adapter is reused across reconnects; `shutdown` poisons it and
/// interrupts whatever the runtime is blocked on, including an in-flight
/// connect.
pub struct WorkerRuntime {
    adapter: SocketAdapter,
    factory: Arc<dyn SocketFactory>,
    dispatcher: Arc<dyn SkillDispatcher>,
    options: WorkerOptions,
    state: Mutex<WorkerState>,
    pause_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    tasks_completed: AtomicU64,
}

impl WorkerRuntime {
    /// Create a runtime. No connection is made until `connect`.
    pub fn new(
        reactor: Reactor,
        factory: Arc<dyn SocketFactory>,
        dispatcher: Arc<dyn SkillDispatcher>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            adapter: SocketAdapter::new(reactor),
            factory,
            dispatcher,
            options,
            state: Mutex::new(WorkerState::Disconnected),
            pause_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            tasks_completed: AtomicU64::new(0),
        }
    }

    /// Current runtime state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Whether a stream is attached.
    pub fn is_connected(&self) -> bool {
        self.adapter.is_open()
    }

    /// Tasks completed across all connections.
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    /// The adapter, for byte-level accounting.
    pub fn adapter(&self) -> &SocketAdapter {
        &self.adapter
    }

    /// Connect to the manager on the calling thread. Closes any previous
    /// stream first; interrupted by `shutdown`.
    pub fn connect(&self) -> Result<()> {
        self.set_state(WorkerState::Connecting);
        let result = self.adapter.connect_blocking(
            &*self.factory,
            &self.options.manager_host,
            self.options.manager_port,
            self.options.connect_timeout,
        );
        match result {
            Ok(()) => {
                self.set_state(WorkerState::Connected);
                info!(
                    manager = %format!("{}:{}", self.options.manager_host, self.options.manager_port),
                    "connected to manager"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(WorkerState::Disconnected);
                Err(err)
            }
        }
    }

    /// Connect to the manager via the reactor.
    pub async fn connect_async(&self) -> Result<()> {
        self.set_state(WorkerState::Connecting);
        let result = self
            .adapter
            .connect_async(
                &*self.factory,
                &self.options.manager_host,
                self.options.manager_port,
            )
            .await;
        match result {
            Ok(()) => {
                self.set_state(WorkerState::Connected);
                info!(
                    manager = %format!("{}:{}", self.options.manager_host, self.options.manager_port),
                    "connected to manager"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(WorkerState::Disconnected);
                Err(err)
            }
        }
    }

    /// Request a pause; the loop returns [`WorkerOutcome::Paused`] at its
    /// next iteration boundary.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    /// Shut the runtime down: poison the adapter so blocked I/O (or an
    /// in-flight connect) errors out promptly.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.adapter.shutdown();
        self.set_state(WorkerState::Stopped);
    }

    /// Run the task loop on the calling thread until pause, peer close,
    /// shutdown, or error.
    pub fn run_blocking(&self) -> Result<WorkerOutcome> {
        let outcome = self.run_blocking_inner();
        self.finish_run(&outcome);
        outcome
    }

    fn run_blocking_inner(&self) -> Result<WorkerOutcome> {
        self.set_state(WorkerState::Running);
        loop {
            if self.pause_requested.swap(false, Ordering::AcqRel) {
                return Ok(WorkerOutcome::Paused);
            }
            if self.shutdown_requested.load(Ordering::Acquire) {
                return Ok(WorkerOutcome::Finished);
            }
            let header = match self.adapter.blocking_read_header() {
                Ok(header) => header,
                // EOF between frames is the manager going away.
                Err(TransportError::ConnectionClosed) => return Ok(WorkerOutcome::Finished),
                Err(err) => return Err(err),
            };
            self.options.limits.check(&header)?;
            let payload = self.adapter.blocking_read_exact(header.body_size as usize)?;
            let reply = self.execute(header.task_id, header.skill_id, payload)?;
            self.adapter.blocking_write_message(&reply)?;
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run the task loop as a reactor coroutine until pause, peer close,
    /// shutdown, or error.
    pub async fn run_async(&self) -> Result<WorkerOutcome> {
        let outcome = self.run_async_inner().await;
        self.finish_run(&outcome);
        outcome
    }

    async fn run_async_inner(&self) -> Result<WorkerOutcome> {
        self.set_state(WorkerState::Running);
        loop {
            if self.pause_requested.swap(false, Ordering::AcqRel) {
                return Ok(WorkerOutcome::Paused);
            }
            if self.shutdown_requested.load(Ordering::Acquire) {
                return Ok(WorkerOutcome::Finished);
            }
            let header = match self.adapter.read_header().await {
                Ok(header) => header,
                Err(TransportError::ConnectionClosed) => return Ok(WorkerOutcome::Finished),
                Err(err) => return Err(err),
            };
            self.options.limits.check(&header)?;
            let payload = self.adapter.read_exact(header.body_size as usize).await?;
            let reply = self.execute(header.task_id, header.skill_id, payload)?;
            self.adapter.write_message(&reply).await?;
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn execute(&self, task_id: u32, skill_id: u32, payload: Bytes) -> Result<TaskMessage> {
        let response = self.dispatcher.dispatch(task_id, skill_id, payload);
        TaskMessage::new(task_id, skill_id, response)
    }

    fn finish_run(&self, outcome: &Result<WorkerOutcome>) {
        match outcome {
            Ok(WorkerOutcome::Paused) => {
                debug!("worker runtime paused");
                self.set_state(WorkerState::Paused);
            }
            Ok(WorkerOutcome::Finished) => {
                debug!("worker runtime finished");
                self.adapter.close();
                if !self.shutdown_requested.load(Ordering::Acquire) {
                    self.set_state(WorkerState::Disconnected);
                }
            }
            Err(_) => {
                self.adapter.close();
                if !self.shutdown_requested.load(Ordering::Acquire) {
                    self.set_state(WorkerState::Disconnected);
                }
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("state", &self.state())
            .field("tasks_completed", &self.tasks_completed())
            .finish()
    }
}
