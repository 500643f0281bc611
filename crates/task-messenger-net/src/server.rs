//! Transport server: listener lifecycle and the dedicated acceptor thread.
//!
//! The acceptor calls `accept_timed` in a loop so shutdown latency is
//! bounded by the accept timeout, and runs a maintenance pass on an
//! interval (dropping closed sockets from its bookkeeping and reaping
//! completed sessions).
//!
//! Shutdown ordering is strict: clear the running flag, join the acceptor
//! thread, then close the listening socket. Closing first races the
//! network stack's accept path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::session::SessionManager;
use crate::socket::{AcceptOutcome, OverlayListener, SocketFactory, WeakSocketAdapter};
use crate::state::ServerState;

/// Back-off after an accept error while still running.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for the transport server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The address to bind to.
    pub listen_host: String,
    /// The port to listen on.
    pub listen_port: u16,
    /// How long one blocking accept attempt may wait. Bounds shutdown
    /// latency.
    pub accept_timeout: Duration,
    /// Minimum spacing between maintenance passes.
    pub maintenance_interval: Duration,
    /// Enable TCP_NODELAY on accepted connections.
    pub no_delay: bool,
}

impl ServerConfig {
    /// Create a server configuration with default timings.
    pub fn new(listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            accept_timeout: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(2),
            no_delay: true,
        }
    }

    /// Set the accept timeout.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the maintenance interval.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// The bind address string (host:port).
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// Accepts worker connections and hands them to the session manager.
pub struct TransportServer {
    config: ServerConfig,
    factory: Arc<dyn SocketFactory>,
    sessions: Arc<SessionManager>,
    state: Arc<Mutex<ServerState>>,
    running: Arc<AtomicBool>,
    listener: Mutex<Option<Arc<dyn OverlayListener>>>,
    acceptor: Mutex<Option<thread::JoinHandle<()>>>,
    active: Arc<Mutex<Vec<WeakSocketAdapter>>>,
}

impl TransportServer {
    /// Create a server. Nothing is bound until [`start`](Self::start).
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn SocketFactory>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            factory,
            sessions,
            state: Arc::new(Mutex::new(ServerState::Stopped)),
            running: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            acceptor: Mutex::new(None),
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind, listen, and start the acceptor thread.
    ///
    /// Starting an already-running server is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.state.lock() = ServerState::Starting;

        let listener = match self
            .factory
            .bind(&self.config.listen_host, self.config.listen_port)
        {
            Ok(listener) => listener,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                *self.state.lock() = ServerState::Stopped;
                return Err(err);
            }
        };
        *self.listener.lock() = Some(Arc::clone(&listener));

        let running = Arc::clone(&self.running);
        let sessions = Arc::clone(&self.sessions);
        let active = Arc::clone(&self.active);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("tm-accept".to_string())
            .spawn(move || accept_loop(listener, running, sessions, active, config))
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                self.listener.lock().take();
                *self.state.lock() = ServerState::Stopped;
                TransportError::Io(err)
            })?;
        *self.acceptor.lock() = Some(handle);
        *self.state.lock() = ServerState::Listening;
        info!(addr = %self.config.bind_addr(), "transport server listening");
        Ok(())
    }

    /// Stop the server. Idempotent.
    ///
    /// Returns once the acceptor has joined and the listener is closed;
    /// with the default accept timeout that is well under a second.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ServerState::Stopping;

        // Join the acceptor BEFORE closing the listening socket. The
        // overlay stack races a close against a blocked accept.
        if let Some(handle) = self.acceptor.lock().take()
            && handle.join().is_err()
        {
            error!("acceptor thread panicked");
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.close();
        }
        self.sessions.shutdown();
        self.active.lock().clear();
        *self.state.lock() = ServerState::Stopped;
        info!("transport server stopped");
    }

    /// Current server state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Whether the server is accepting connections.
    pub fn is_listening(&self) -> bool {
        *self.state.lock() == ServerState::Listening
    }

    /// The actual bound address, once listening. Useful when binding
    /// port 0 to discover the assigned port.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .map(|listener| listener.local_addr())
    }

    /// The session manager this server feeds.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("bind_addr", &self.config.bind_addr())
            .field("state", &self.state())
            .field("sessions", &self.sessions.session_count())
            .finish()
    }
}

fn accept_loop(
    listener: Arc<dyn OverlayListener>,
    running: Arc<AtomicBool>,
    sessions: Arc<SessionManager>,
    active: Arc<Mutex<Vec<WeakSocketAdapter>>>,
    config: ServerConfig,
) {
    debug!("acceptor thread running");
    let mut last_maintenance = Instant::now();
    while running.load(Ordering::Acquire) {
        match listener.accept_timed(config.accept_timeout) {
            AcceptOutcome::Accepted(stream) => {
                if !running.load(Ordering::Acquire) {
                    let _ = stream.shutdown();
                    break;
                }
                if let Err(err) = stream.set_nodelay(config.no_delay) {
                    warn!(error = %err, "failed to set TCP_NODELAY on accepted connection");
                }
                let session = sessions.create_session(stream);
                active.lock().push(session.adapter().downgrade());
                debug!(session = %session.id(), "connection accepted");
            }
            AcceptOutcome::TimedOut => {}
            AcceptOutcome::Aborted => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                warn!("listener aborted while running");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
            AcceptOutcome::Failed(err) => {
                if running.load(Ordering::Acquire) {
                    error!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
        if last_maintenance.elapsed() >= config.maintenance_interval {
            last_maintenance = Instant::now();
            run_maintenance(&sessions, &active);
        }
    }
    debug!("acceptor thread exiting");
}

fn run_maintenance(sessions: &SessionManager, active: &Mutex<Vec<WeakSocketAdapter>>) {
    active
        .lock()
        .retain(|weak| weak.upgrade().is_some_and(|adapter| adapter.is_open()));
    let reaped = sessions.cleanup_completed_sessions();
    if reaped > 0 {
        debug!(reaped, "reaped completed sessions");
    }
    let stats = sessions.stats();
    debug!(
        sessions = stats.live_sessions,
        tasks = stats.tasks_completed,
        pool_depth = stats.pool_depth,
        "maintenance pass"
    );
}
