//! Cooperative I/O reactor and task runtime for Task Messenger.
//!
//! This crate provides the runtime underneath the transport layer:
//!
//! - **Reactor**: an event loop over registered pending operations, each a
//!   `(try_complete, waker)` pair polled by worker threads at a bounded
//!   interval
//! - **Tasks**: spawned coroutines with join handles, scheduled on the
//!   reactor's ready queue when woken
//! - **Work guards**: keep-alive tokens for phases with no registered I/O
//! - **Statistics**: per-category completion-attempt histograms and a
//!   failure-attempt aggregate
//!
//! # Example
//!
//! ```ignore
//! use task_messenger_core::{OpCategory, Reactor};
//!
//! let reactor = Reactor::new();
//! let guard = reactor.make_work_guard();
//! reactor.start(2)?;
//!
//! let handle = reactor.spawn(async {
//!     // awaitables register pending ops against the reactor
//! });
//!
//! handle.wait();
//! drop(guard);
//! reactor.stop();
//! ```

mod error;
mod reactor;
mod stats;
mod task;

pub use error::{Result, RuntimeError};
pub use reactor::{DEFAULT_POLL_INTERVAL, Reactor, WorkGuard};
pub use stats::{AttemptAggregate, HISTOGRAM_BUCKETS, OpCategory, ReactorStats};
pub use task::JoinHandle;
