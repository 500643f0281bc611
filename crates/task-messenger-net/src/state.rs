//! State enums for sessions, the transport server, and the worker runtime.

/// Current state of a dispatch session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for the next task from the pool.
    #[default]
    Open,
    /// Writing a framed request to the worker.
    Sending,
    /// Reading the framed response.
    Receiving,
    /// Terminal: the socket is closed and the coroutine has exited.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Sending => write!(f, "Sending"),
            Self::Receiving => write!(f, "Receiving"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Current state of the transport server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Server is not running.
    #[default]
    Stopped,
    /// Server is binding its listener.
    Starting,
    /// Server is accepting connections.
    Listening,
    /// Server is shutting down.
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Current state of the worker runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Not connected to any manager.
    #[default]
    Disconnected,
    /// Currently establishing a connection.
    Connecting,
    /// Connected and ready to process tasks.
    Connected,
    /// Processing tasks.
    Running,
    /// Paused by request; `run` may be called again.
    Paused,
    /// Shut down; the adapter is closed.
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Open.to_string(), "Open");
        assert_eq!(SessionState::Closed.to_string(), "Closed");
        assert_eq!(ServerState::Listening.to_string(), "Listening");
        assert_eq!(WorkerState::Paused.to_string(), "Paused");
    }
}
