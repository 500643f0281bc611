//! Socket adapter: awaitable and blocking I/O over overlay-capable streams.
//!
//! The transport never touches `TcpStream` directly. A [`SocketFactory`]
//! yields streams and listeners already configured for whatever network
//! carries the traffic. The built-in [`OsSocketFactory`] uses the host TCP
//! stack; an overlay network provides the same capability through its own
//! factory.
//!
//! All streams are non-blocking. Awaitable operations register a
//! `try_complete` closure with the reactor; the closure attempts the
//! syscall on every pass, accumulates partial progress, and stores its
//! result where the suspended coroutine can observe it. The "blocking"
//! variants run the same progress functions in a sleep-slice loop on the
//! calling thread, so a concurrent `close()` interrupts them within one
//! slice.

use std::future::Future;
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use task_messenger_core::{OpCategory, Reactor};
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::wire::{HEADER_SIZE, TaskHeader, TaskMessage};

/// Sleep slice for the blocking accept loop.
const ACCEPT_POLL_SLICE: Duration = Duration::from_millis(20);
/// Sleep slice for blocking reads/writes and blocking connect.
const BLOCKING_POLL_SLICE: Duration = Duration::from_millis(1);

/// A connected (or connecting) stream socket usable by the transport.
///
/// Streams are handed out non-blocking; `Read`/`Write` return
/// `WouldBlock` when not ready.
pub trait OverlayStream: Read + Write + Send {
    /// Toggle non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
    /// Toggle TCP_NODELAY (or the overlay's equivalent).
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
    /// The peer address, once connected.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    /// Shut down both directions.
    fn shutdown(&self) -> io::Result<()>;
    /// Poll completion of an in-progress connect. `Ok(true)` once the
    /// stream is established; a refused or failed connect is an error.
    fn poll_connected(&mut self) -> io::Result<bool>;
}

impl OverlayStream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn poll_connected(&mut self) -> io::Result<bool> {
        if let Some(err) = self.take_error()? {
            return Err(err);
        }
        match TcpStream::peer_addr(self) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Outcome of a timed accept attempt.
pub enum AcceptOutcome {
    /// A connection arrived.
    Accepted(Box<dyn OverlayStream>),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The listener has been closed.
    Aborted,
    /// The accept syscall failed.
    Failed(TransportError),
}

/// A listening socket usable by the acceptor thread.
pub trait OverlayListener: Send + Sync {
    /// Non-blocking accept: `Ok(None)` when no connection is pending,
    /// `Err(ConnectionClosed)` once the listener is closed.
    fn try_accept(&self) -> Result<Option<Box<dyn OverlayStream>>>;

    /// The bound local address.
    fn local_addr(&self) -> SocketAddr;

    /// Close the listener. Idempotent; pending and future accepts observe
    /// [`AcceptOutcome::Aborted`].
    fn close(&self);

    /// Accept with a bounded wait, polling in short slices so `close()`
    /// interrupts promptly.
    fn accept_timed(&self, timeout: Duration) -> AcceptOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_accept() {
                Ok(Some(stream)) => return AcceptOutcome::Accepted(stream),
                Ok(None) => {}
                Err(TransportError::ConnectionClosed) => return AcceptOutcome::Aborted,
                Err(err) => return AcceptOutcome::Failed(err),
            }
            if Instant::now() >= deadline {
                return AcceptOutcome::TimedOut;
            }
            thread::sleep(ACCEPT_POLL_SLICE);
        }
    }
}

/// Capability for opening sockets on some network. The built-in
/// implementation is the host TCP stack; an overlay network supplies the
/// same interface with its identity and network join already performed.
pub trait SocketFactory: Send + Sync {
    /// Bind and listen.
    fn bind(&self, host: &str, port: u16) -> Result<Arc<dyn OverlayListener>>;

    /// Initiate a non-blocking connect. The returned stream may still be
    /// connecting; completion is observed through
    /// [`OverlayStream::poll_connected`].
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn OverlayStream>>;
}

/// Listener over the host TCP stack.
pub struct OsListener {
    inner: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl OverlayListener for OsListener {
    fn try_accept(&self) -> Result<Option<Box<dyn OverlayStream>>> {
        let guard = self.inner.lock();
        let Some(listener) = guard.as_ref() else {
            return Err(TransportError::ConnectionClosed);
        };
        match listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true).map_err(TransportError::Io)?;
                Ok(Some(Box::new(stream)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        self.inner.lock().take();
    }
}

/// Socket factory over the host TCP stack.
#[derive(Debug, Default)]
pub struct OsSocketFactory;

impl OsSocketFactory {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))
}

impl SocketFactory for OsSocketFactory {
    fn bind(&self, host: &str, port: u16) -> Result<Arc<dyn OverlayListener>> {
        let listener = TcpListener::bind((host, port)).map_err(TransportError::Bind)?;
        listener.set_nonblocking(true).map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        Ok(Arc::new(OsListener {
            inner: Mutex::new(Some(listener)),
            local_addr,
        }))
    }

    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn OverlayStream>> {
        let addr = resolve(host, port).map_err(TransportError::Connect)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Connect)?;
        socket.set_nonblocking(true).map_err(TransportError::Connect)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(TransportError::Connect(err)),
        }
        let stream: TcpStream = socket.into();
        Ok(Box::new(stream))
    }
}

/// Internal state shared between the adapter, its in-flight operation, and
/// weak bookkeeping references.
struct AdapterShared {
    reactor: Reactor,
    stream: Mutex<Option<Box<dyn OverlayStream>>>,
    shut_down: AtomicBool,
    in_flight: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl AdapterShared {
    fn close_stream(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown();
        }
    }
}

/// Non-owning reference to a [`SocketAdapter`], held by acceptor
/// bookkeeping so it never extends the adapter's lifetime.
pub struct WeakSocketAdapter {
    shared: Weak<AdapterShared>,
}

impl WeakSocketAdapter {
    /// Upgrade back to a usable adapter, if any clone is still alive.
    pub fn upgrade(&self) -> Option<SocketAdapter> {
        self.shared
            .upgrade()
            .map(|shared| SocketAdapter { shared })
    }
}

/// Wraps one stream with awaitable and blocking I/O.
///
/// Cheap to clone; clones share the stream and its counters. At most one
/// awaitable operation may be in flight at a time; a second one completes
/// immediately with [`TransportError::Busy`].
#[derive(Clone)]
pub struct SocketAdapter {
    shared: Arc<AdapterShared>,
}

impl SocketAdapter {
    /// Create an adapter with no stream; `connect_blocking` or
    /// `connect_async` attaches one.
    pub fn new(reactor: Reactor) -> Self {
        Self {
            shared: Arc::new(AdapterShared {
                reactor,
                stream: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    /// Wrap an accepted stream.
    pub fn from_stream(reactor: Reactor, stream: Box<dyn OverlayStream>) -> Self {
        let adapter = Self::new(reactor);
        *adapter.shared.stream.lock() = Some(stream);
        adapter
    }

    /// Non-owning reference for bookkeeping lists.
    pub fn downgrade(&self) -> WeakSocketAdapter {
        WeakSocketAdapter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether a stream is attached.
    pub fn is_open(&self) -> bool {
        self.shared.stream.lock().is_some()
    }

    /// Peer address of the attached stream, if connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared
            .stream
            .lock()
            .as_ref()
            .and_then(|stream| stream.peer_addr().ok())
    }

    /// Total payload-carrying bytes read through this adapter.
    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written through this adapter.
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Drop the stream. Any in-flight operation observes the closed
    /// adapter on its next pass and completes with `ConnectionClosed`.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.close_stream();
    }

    /// Close and poison the adapter: subsequent connects are refused.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        self.shared.close_stream();
    }

    fn begin_connect(&self, factory: &dyn SocketFactory, host: &str, port: u16) -> Result<()> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        // Reconnects reuse the adapter: drop any previous stream first.
        self.shared.close_stream();
        let stream = factory.connect(host, port)?;
        let mut guard = self.shared.stream.lock();
        if self.shared.shut_down.load(Ordering::Acquire) {
            let _ = stream.shutdown();
            return Err(TransportError::ConnectionClosed);
        }
        *guard = Some(stream);
        Ok(())
    }

    /// Connect on the calling thread, polling in short slices.
    ///
    /// `shutdown()` from another thread interrupts the attempt: the closed
    /// stream surfaces as `ConnectionClosed` within one slice.
    pub fn connect_blocking(
        &self,
        factory: &dyn SocketFactory,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<()> {
        self.begin_connect(factory, host, port)?;
        let deadline = Instant::now() + timeout;
        loop {
            match advance_connect(&self.shared) {
                Step::Done(result) => return result,
                Step::NotReady => {}
            }
            if Instant::now() >= deadline {
                self.close();
                return Err(TransportError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )));
            }
            thread::sleep(BLOCKING_POLL_SLICE);
        }
    }

    /// Connect via the reactor.
    pub async fn connect_async(
        &self,
        factory: &dyn SocketFactory,
        host: &str,
        port: u16,
    ) -> Result<()> {
        self.begin_connect(factory, host, port)?;
        let shared = Arc::clone(&self.shared);
        IoFuture::new(
            Arc::clone(&self.shared),
            OpCategory::Connect,
            move || advance_connect(&shared),
        )
        .await
    }

    /// Read exactly `len` bytes via the reactor.
    pub fn read_exact(&self, len: usize) -> IoFuture<Bytes> {
        let shared = Arc::clone(&self.shared);
        let mut progress = ReadProgress::new(len);
        IoFuture::new(Arc::clone(&self.shared), OpCategory::Read, move || {
            advance_read(&shared, &mut progress)
        })
    }

    /// Read and decode one task header via the reactor.
    pub async fn read_header(&self) -> Result<TaskHeader> {
        let bytes = self.read_exact(HEADER_SIZE).await?;
        TaskHeader::decode(bytes.as_ref())
    }

    /// Write a full buffer via the reactor. Resolves to the bytes written.
    pub fn write_all(&self, payload: Bytes) -> IoFuture<usize> {
        self.write_spans(None, payload)
    }

    /// Scatter-gather write of one framed message via the reactor: header
    /// and payload drain through `write_vectored`, typically one syscall.
    pub fn write_message(&self, message: &TaskMessage) -> IoFuture<usize> {
        let (header, payload) = message.wire_bytes();
        self.write_spans(Some(header), payload)
    }

    fn write_spans(&self, header: Option<[u8; HEADER_SIZE]>, payload: Bytes) -> IoFuture<usize> {
        let shared = Arc::clone(&self.shared);
        let mut progress = WriteProgress {
            header,
            payload,
            written: 0,
        };
        IoFuture::new(Arc::clone(&self.shared), OpCategory::Write, move || {
            advance_write(&shared, &mut progress)
        })
    }

    /// Read exactly `len` bytes on the calling thread, polling in short
    /// slices. `close()` from another thread interrupts within one slice.
    pub fn blocking_read_exact(&self, len: usize) -> Result<Bytes> {
        let mut progress = ReadProgress::new(len);
        loop {
            match advance_read(&self.shared, &mut progress) {
                Step::Done(result) => return result,
                Step::NotReady => thread::sleep(BLOCKING_POLL_SLICE),
            }
        }
    }

    /// Read and decode one task header on the calling thread.
    pub fn blocking_read_header(&self) -> Result<TaskHeader> {
        let bytes = self.blocking_read_exact(HEADER_SIZE)?;
        TaskHeader::decode(bytes.as_ref())
    }

    /// Write one framed message on the calling thread.
    pub fn blocking_write_message(&self, message: &TaskMessage) -> Result<usize> {
        let (header, payload) = message.wire_bytes();
        let mut progress = WriteProgress {
            header: Some(header),
            payload,
            written: 0,
        };
        loop {
            match advance_write(&self.shared, &mut progress) {
                Step::Done(result) => return result,
                Step::NotReady => thread::sleep(BLOCKING_POLL_SLICE),
            }
        }
    }
}

impl std::fmt::Debug for SocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketAdapter")
            .field("open", &self.is_open())
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// One step of an operation's progress function.
enum Step<T> {
    Done(Result<T>),
    NotReady,
}

struct ReadProgress {
    buf: Vec<u8>,
    filled: usize,
}

impl ReadProgress {
    fn new(len: usize) -> Self {
        Self {
            buf: vec![0u8; len],
            filled: 0,
        }
    }
}

fn advance_read(shared: &AdapterShared, progress: &mut ReadProgress) -> Step<Bytes> {
    let mut guard = shared.stream.lock();
    let Some(stream) = guard.as_mut() else {
        return Step::Done(Err(TransportError::ConnectionClosed));
    };
    loop {
        if progress.filled == progress.buf.len() {
            let buf = mem::take(&mut progress.buf);
            return Step::Done(Ok(Bytes::from(buf)));
        }
        match stream.read(&mut progress.buf[progress.filled..]) {
            Ok(0) => return Step::Done(Err(TransportError::ConnectionClosed)),
            Ok(n) => {
                progress.filled += n;
                shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::NotReady,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Step::Done(Err(err.into())),
        }
    }
}

struct WriteProgress {
    header: Option<[u8; HEADER_SIZE]>,
    payload: Bytes,
    written: usize,
}

impl WriteProgress {
    fn header_len(&self) -> usize {
        if self.header.is_some() { HEADER_SIZE } else { 0 }
    }

    fn total(&self) -> usize {
        self.header_len() + self.payload.len()
    }
}

fn advance_write(shared: &AdapterShared, progress: &mut WriteProgress) -> Step<usize> {
    let mut guard = shared.stream.lock();
    let Some(stream) = guard.as_mut() else {
        return Step::Done(Err(TransportError::ConnectionClosed));
    };
    loop {
        let total = progress.total();
        if progress.written == total {
            return Step::Done(Ok(total));
        }
        let result = match &progress.header {
            Some(header) if progress.written < HEADER_SIZE => {
                let spans = [
                    IoSlice::new(&header[progress.written..]),
                    IoSlice::new(&progress.payload),
                ];
                stream.write_vectored(&spans)
            }
            _ => {
                let offset = progress.written - progress.header_len();
                stream.write(&progress.payload[offset..])
            }
        };
        match result {
            Ok(0) => return Step::Done(Err(TransportError::ConnectionClosed)),
            Ok(n) => {
                progress.written += n;
                shared.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::NotReady,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Step::Done(Err(err.into())),
        }
    }
}

fn advance_connect(shared: &AdapterShared) -> Step<()> {
    let mut guard = shared.stream.lock();
    let Some(stream) = guard.as_mut() else {
        return Step::Done(Err(TransportError::ConnectionClosed));
    };
    match stream.poll_connected() {
        Ok(true) => {
            trace!("connect completed");
            let _ = stream.set_nodelay(true);
            Step::Done(Ok(()))
        }
        Ok(false) => Step::NotReady,
        Err(err) => Step::Done(Err(TransportError::Connect(err))),
    }
}

/// Result cell shared between a suspended awaitable and its registered
/// `try_complete` closure.
struct OpCell<T> {
    value: Mutex<Option<Result<T>>>,
}

impl<T> OpCell<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
        })
    }

    fn put(&self, value: Result<T>) {
        *self.value.lock() = Some(value);
    }

    fn take(&self) -> Option<Result<T>> {
        self.value.lock().take()
    }
}

/// An awaitable socket operation.
///
/// The first poll attempts the syscall inline; if not ready, the progress
/// function moves into a `try_complete` closure registered with the
/// reactor. Dropping an operation that is still registered closes the
/// adapter: a half-transferred frame is unrecoverable, and sockets are
/// single-use after any failure.
pub struct IoFuture<T> {
    shared: Arc<AdapterShared>,
    cell: Arc<OpCell<T>>,
    category: OpCategory,
    advance: Option<Box<dyn FnMut() -> Step<T> + Send>>,
    registered: bool,
    completed: bool,
}

impl<T: Send + 'static> IoFuture<T> {
    fn new(
        shared: Arc<AdapterShared>,
        category: OpCategory,
        advance: impl FnMut() -> Step<T> + Send + 'static,
    ) -> Self {
        Self {
            shared,
            cell: OpCell::new(),
            category,
            advance: Some(Box::new(advance)),
            registered: false,
            completed: false,
        }
    }
}

impl<T: Send + 'static> Future for IoFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = self.get_mut();
        if let Some(result) = this.cell.take() {
            this.completed = true;
            return Poll::Ready(result);
        }
        if this.registered {
            return Poll::Pending;
        }
        let Some(mut advance) = this.advance.take() else {
            return Poll::Pending;
        };
        if this.shared.in_flight.swap(true, Ordering::AcqRel) {
            this.completed = true;
            return Poll::Ready(Err(TransportError::Busy));
        }
        match advance() {
            Step::Done(result) => {
                this.shared.in_flight.store(false, Ordering::Release);
                this.completed = true;
                Poll::Ready(result)
            }
            Step::NotReady => {
                let cell = Arc::clone(&this.cell);
                let shared = Arc::clone(&this.shared);
                this.registered = true;
                this.shared.reactor.register_pending(
                    this.category,
                    move || match advance() {
                        Step::Done(result) => {
                            cell.put(result);
                            shared.in_flight.store(false, Ordering::Release);
                            true
                        }
                        Step::NotReady => false,
                    },
                    cx.waker().clone(),
                );
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for IoFuture<T> {
    fn drop(&mut self) {
        if self.registered && !self.completed && self.cell.take().is_none() {
            // Cancelled mid-transfer: poison the connection so the
            // registered closure resolves on its next pass.
            self.shared.close_stream();
        }
    }
}

/// Awaitable accept on a listener, registered with the reactor.
pub fn accept_async(listener: Arc<dyn OverlayListener>, reactor: Reactor) -> AcceptAsync {
    AcceptAsync {
        listener,
        reactor,
        cell: OpCell::new(),
        registered: false,
    }
}

/// Awaitable returned by [`accept_async`].
pub struct AcceptAsync {
    listener: Arc<dyn OverlayListener>,
    reactor: Reactor,
    cell: Arc<OpCell<Box<dyn OverlayStream>>>,
    registered: bool,
}

impl Future for AcceptAsync {
    type Output = Result<Box<dyn OverlayStream>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.cell.take() {
            return Poll::Ready(result);
        }
        if this.registered {
            return Poll::Pending;
        }
        match this.listener.try_accept() {
            Ok(Some(stream)) => Poll::Ready(Ok(stream)),
            Err(err) => Poll::Ready(Err(err)),
            Ok(None) => {
                let listener = Arc::clone(&this.listener);
                let cell = Arc::clone(&this.cell);
                this.registered = true;
                this.reactor.register_pending(
                    OpCategory::Accept,
                    move || match listener.try_accept() {
                        Ok(Some(stream)) => {
                            cell.put(Ok(stream));
                            true
                        }
                        Ok(None) => false,
                        Err(err) => {
                            cell.put(Err(err));
                            true
                        }
                    },
                    cx.waker().clone(),
                );
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair() -> (SocketAdapter, SocketAdapter) {
        let factory = OsSocketFactory::new();
        let listener = factory.bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().port();

        let reactor = Reactor::new();
        let client = SocketAdapter::new(reactor.clone());
        client
            .connect_blocking(&factory, "127.0.0.1", port, Duration::from_secs(5))
            .unwrap();

        let AcceptOutcome::Accepted(stream) = listener.accept_timed(Duration::from_secs(5)) else {
            panic!("accept did not produce a connection");
        };
        let server = SocketAdapter::from_stream(reactor, stream);
        (client, server)
    }

    #[test]
    fn blocking_message_round_trip() {
        let (client, server) = connected_pair();
        let message = TaskMessage::new(3, 9, &b"ping"[..]).unwrap();
        let written = client.blocking_write_message(&message).unwrap();
        assert_eq!(written, HEADER_SIZE + 4);

        let header = server.blocking_read_header().unwrap();
        assert_eq!(header, *message.header());
        let body = server.blocking_read_exact(header.body_size as usize).unwrap();
        assert_eq!(body.as_ref(), b"ping");

        assert!(client.bytes_written() >= written as u64);
        assert!(server.bytes_read() >= written as u64);
    }

    #[test]
    fn close_interrupts_blocking_read() {
        let (client, server) = connected_pair();
        let reader = std::thread::spawn(move || server.blocking_read_exact(16));
        std::thread::sleep(Duration::from_millis(20));
        client.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn shutdown_refuses_reconnect() {
        let factory = OsSocketFactory::new();
        let adapter = SocketAdapter::new(Reactor::new());
        adapter.shutdown();
        let result = adapter.connect_blocking(&factory, "127.0.0.1", 1, Duration::from_secs(1));
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn accept_timed_reports_timeout_and_abort() {
        let factory = OsSocketFactory::new();
        let listener = factory.bind("127.0.0.1", 0).unwrap();
        assert!(matches!(
            listener.accept_timed(Duration::from_millis(50)),
            AcceptOutcome::TimedOut
        ));
        listener.close();
        assert!(matches!(
            listener.accept_timed(Duration::from_millis(50)),
            AcceptOutcome::Aborted
        ));
    }

    #[test]
    fn awaitable_write_and_read_round_trip() {
        let factory = OsSocketFactory::new();
        let listener = factory.bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().port();

        let reactor = Reactor::new();
        let _guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        let client = SocketAdapter::new(reactor.clone());
        client
            .connect_blocking(&factory, "127.0.0.1", port, Duration::from_secs(5))
            .unwrap();
        let AcceptOutcome::Accepted(stream) = listener.accept_timed(Duration::from_secs(5)) else {
            panic!("accept did not produce a connection");
        };
        let server = SocketAdapter::from_stream(reactor.clone(), stream);

        let written =
            futures::executor::block_on(client.write_all(Bytes::from_static(b"abcdef"))).unwrap();
        assert_eq!(written, 6);
        let read = futures::executor::block_on(server.read_exact(6)).unwrap();
        assert_eq!(read.as_ref(), b"abcdef");

        reactor.stop();
    }

    #[test]
    fn accept_async_yields_connection() {
        let factory = OsSocketFactory::new();
        let listener = factory.bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().port();

        let reactor = Reactor::new();
        let _guard = reactor.make_work_guard();
        reactor.start(1).unwrap();

        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            TcpStream::connect(("127.0.0.1", port)).unwrap()
        });
        let stream =
            futures::executor::block_on(accept_async(listener, reactor.clone())).unwrap();
        assert!(stream.peer_addr().is_ok());

        client.join().unwrap();
        reactor.stop();
    }

    #[test]
    fn second_in_flight_op_is_rejected() {
        let (client, _server) = connected_pair();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        // Nothing to read yet, so the first op suspends and registers.
        let mut first = client.read_exact(8);
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());

        let mut second = client.read_exact(8);
        match Pin::new(&mut second).poll(&mut cx) {
            Poll::Ready(Err(TransportError::Busy)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }
}
