//! Error types for the transport layer.

use std::fmt;
use std::io;

/// Transport-specific errors.
#[derive(Debug)]
pub enum TransportError {
    /// The listening socket could not be bound.
    Bind(io::Error),
    /// The manager could not be reached.
    Connect(io::Error),
    /// Peer EOF or local close. Normal session termination.
    ConnectionClosed,
    /// Invalid header, oversized body, or a zero task id.
    Protocol(String),
    /// Underlying syscall failure other than the above.
    Io(io::Error),
    /// The task pool has been shut down.
    PoolShutdown,
    /// A second awaitable operation was issued while one was in flight.
    Busy,
}

impl TransportError {
    /// Whether this error is the ordinary end of a connection rather than
    /// something worth an error-level log line.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "failed to bind listener: {err}"),
            Self::Connect(err) => write!(f, "failed to connect: {err}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::PoolShutdown => write!(f, "task pool has shut down"),
            Self::Busy => write!(f, "another awaitable operation is already in flight"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(err) | Self::Connect(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

/// A specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
