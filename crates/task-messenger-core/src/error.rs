//! Error types for the reactor runtime.

use std::fmt;

/// Errors surfaced by reactor lifecycle operations.
#[derive(Debug)]
pub enum RuntimeError {
    /// A worker thread could not be spawned.
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadSpawn(err) => write!(f, "failed to spawn reactor worker thread: {err}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ThreadSpawn(err) => Some(err),
        }
    }
}

/// A specialized Result type for reactor operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
