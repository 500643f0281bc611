//! Transport and session layer for Task Messenger.
//!
//! This crate implements the dispatch fabric between a manager and its
//! worker fleet:
//!
//! - **Wire framing**: a 12-byte little-endian header plus opaque payload
//! - **Socket adapter**: awaitable and blocking I/O over factory-provided
//!   streams, with scatter-gather sends
//! - **Task pool**: an awaitable FIFO bridging producers to suspended
//!   sessions
//! - **Sessions**: one coroutine per accepted worker connection
//! - **Transport server**: listener lifecycle and the dedicated acceptor
//!   thread
//! - **Worker runtime**: the peer-side loop, in blocking and async
//!   variants
//!
//! # Manager side
//!
//! ```ignore
//! use std::sync::Arc;
//! use task_messenger_core::Reactor;
//! use task_messenger_net::{
//!     OsSocketFactory, ProtocolLimits, ServerConfig, SessionManager, TaskPool,
//!     TransportServer,
//! };
//!
//! let reactor = Reactor::new();
//! reactor.start(1)?;
//!
//! let pool = Arc::new(TaskPool::new());
//! let sink = Arc::new(|task_id, payload| { /* consume responses */ });
//! let sessions = SessionManager::new(reactor, pool, sink, ProtocolLimits::default());
//!
//! let server = TransportServer::new(
//!     ServerConfig::new("0.0.0.0", 8080),
//!     Arc::new(OsSocketFactory::new()),
//!     sessions,
//! );
//! server.start()?;
//! ```
//!
//! # Worker side
//!
//! ```ignore
//! use task_messenger_net::{WorkerOptions, WorkerRuntime};
//!
//! let runtime = WorkerRuntime::new(reactor, factory, dispatcher,
//!     WorkerOptions::new("localhost", 8080));
//! runtime.connect()?;
//! runtime.run_blocking()?;
//! ```

mod error;
mod pool;
mod server;
mod session;
mod socket;
mod state;
mod wire;
mod worker;

pub use error::{Result, TransportError};
pub use pool::{GetNext, TaskPool};
pub use server::{ServerConfig, TransportServer};
pub use session::{
    DispatchStats, ResponseSink, Session, SessionId, SessionManager, SessionMetrics,
};
pub use socket::{
    AcceptAsync, AcceptOutcome, IoFuture, OsSocketFactory, OverlayListener, OverlayStream,
    SocketAdapter, SocketFactory, WeakSocketAdapter, accept_async,
};
pub use state::{ServerState, SessionState, WorkerState};
pub use wire::{
    DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, ProtocolLimits, TaskHeader, TaskMessage,
};
pub use worker::{SkillDispatcher, WorkerOptions, WorkerOutcome, WorkerRuntime};
