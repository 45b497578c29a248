// Per-session TCP relay: bind, accept loop, and per-connection reader threads.
//
// Architecture: thread-per-connection around a shared, locked `Session`.
//
// - **Relay thread** (one per session): binds the listener, publishes the
//   bound address through the handle's readiness slot, then runs the accept
//   loop. The listener is non-blocking so the loop can notice `stop()`; when
//   nothing is pending it sleeps for `accept_poll_interval`.
// - **Reader threads** (one per connection): read up to `read_buffer_size`
//   bytes at a time and hand each non-empty read to `Session::broadcast`.
//   No framing: a chunk is whatever one `read` returned. On EOF or error the
//   connection moves to `Disconnected`, removes itself from the set, and shuts
//   its socket down.
// - **Writer threads** (one per connection) are owned by `session.rs`.
//
// Readiness: `spawn_relay` returns as soon as the relay thread is running, not
// once it is bound. Callers that need the address must go through
// `RelayHandle::wait_ready`, which blocks until the relay thread has either
// bound (address) or failed (bind error). The slot is written exactly once,
// and a drop guard fills it if the relay thread dies first, so waiters never
// block forever.
//
// Teardown: when a reader removes the last connection of a session, the
// relay calls its `TeardownHook` (if any) after releasing the session lock.
// The coordinator uses this to unregister the session and stop the relay.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use huddle_protocol::SessionId;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, info_span, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::session::{ConnectionId, Session};

/// Called with the session id when a relay's last connection leaves.
pub type TeardownHook = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Result of the relay's bind phase, published once.
#[derive(Clone, Debug)]
enum BindOutcome {
    Bound(SocketAddr),
    Failed(Arc<io::Error>),
    Exited,
}

/// One-shot slot the relay thread fills after binding.
struct Readiness {
    outcome: Mutex<Option<BindOutcome>>,
    published: Condvar,
}

impl Readiness {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            published: Condvar::new(),
        }
    }

    /// First publication wins; later calls are ignored.
    fn publish(&self, outcome: BindOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.published.notify_all();
        }
    }

    fn wait(&self) -> BindOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.published.wait(&mut slot);
        }
    }

    fn peek(&self) -> Option<BindOutcome> {
        self.outcome.lock().clone()
    }
}

/// Publishes `Exited` if the relay thread returns or unwinds before binding.
struct ReadinessGuard(Arc<Readiness>);

impl Drop for ReadinessGuard {
    fn drop(&mut self) {
        self.0.publish(BindOutcome::Exited);
    }
}

/// Handle to a running relay.
pub struct RelayHandle {
    session_id: SessionId,
    bind_addr: String,
    readiness: Arc<Readiness>,
    session: Arc<Mutex<Session>>,
    keep_running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RelayHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Block until the relay has bound its listener, then return the bound
    /// address. Returns the bind error if binding failed.
    pub fn wait_ready(&self) -> Result<SocketAddr, RelayError> {
        match self.readiness.wait() {
            BindOutcome::Bound(addr) => Ok(addr),
            BindOutcome::Failed(source) => Err(RelayError::Bind {
                addr: self.bind_addr.clone(),
                source,
            }),
            BindOutcome::Exited => Err(RelayError::NotReady),
        }
    }

    /// The bound address, if the relay has finished binding. Never blocks.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.readiness.peek() {
            Some(BindOutcome::Bound(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Returns the number of open connections in this relay's session.
    pub fn connection_count(&self) -> usize {
        self.session.lock().connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// Stop accepting, shut down every open connection, and wait for the
    /// relay thread to exit. Streams the accept loop picks up after this are
    /// refused by the closed session. Safe to call more than once.
    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.session.lock().close_all();
        let thread = self.thread.lock().take();
        if let Some(handle) = thread {
            let _ = handle.join();
        }
    }
}

/// Shared state handed to the accept loop and to every reader thread.
#[derive(Clone)]
struct RelayContext {
    session_id: SessionId,
    session: Arc<Mutex<Session>>,
    keep_running: Arc<AtomicBool>,
    read_buffer_size: usize,
    accept_poll_interval: Duration,
    on_empty: Option<TeardownHook>,
}

/// Start a relay for `session_id` on its own thread. Returns once the thread
/// is spawned; use `RelayHandle::wait_ready` for the bound address.
pub fn spawn_relay(
    session_id: SessionId,
    config: &RelayConfig,
    on_empty: Option<TeardownHook>,
) -> Result<RelayHandle, RelayError> {
    let bind_addr = format!("{}:{}", config.host, config.port);
    let readiness = Arc::new(Readiness::new());
    let session = Arc::new(Mutex::new(Session::new(
        session_id,
        config.outbound_queue_capacity,
    )));
    let keep_running = Arc::new(AtomicBool::new(true));

    let ctx = RelayContext {
        session_id,
        session: Arc::clone(&session),
        keep_running: Arc::clone(&keep_running),
        read_buffer_size: config.read_buffer_size.max(1),
        accept_poll_interval: config.accept_poll_interval,
        on_empty,
    };
    let host = config.host.clone();
    let port = config.port;
    let thread_readiness = Arc::clone(&readiness);

    let thread = thread::Builder::new()
        .name(format!("huddle-relay-{session_id}"))
        .spawn(move || {
            let guard = ReadinessGuard(thread_readiness);
            run_relay(&host, port, ctx, &guard.0);
        })
        .map_err(RelayError::Spawn)?;

    Ok(RelayHandle {
        session_id,
        bind_addr,
        readiness,
        session,
        keep_running,
        thread: Mutex::new(Some(thread)),
    })
}

/// Relay thread body: bind, publish, accept until stopped.
fn run_relay(host: &str, port: u16, ctx: RelayContext, readiness: &Readiness) {
    let listener = match bind_listener(host, port) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(session = %ctx.session_id, host, port, error = %e, "relay bind failed");
            readiness.publish(BindOutcome::Failed(Arc::new(e)));
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            readiness.publish(BindOutcome::Failed(Arc::new(e)));
            return;
        }
    };

    info!(session = %ctx.session_id, %addr, "relay listening");
    readiness.publish(BindOutcome::Bound(addr));

    accept_loop(&listener, &ctx);
    info!(session = %ctx.session_id, %addr, "relay stopped");
}

fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))?;
    // Non-blocking so the accept loop can check keep_running periodically.
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(listener: &TcpListener, ctx: &RelayContext) {
    while ctx.keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => admit_connection(ctx, stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ctx.accept_poll_interval);
            }
            Err(e) => {
                warn!(session = %ctx.session_id, error = %e, "accept failed");
                thread::sleep(ctx.accept_poll_interval);
            }
        }
    }
}

/// Register an accepted stream and spawn its reader thread.
fn admit_connection(ctx: &RelayContext, stream: TcpStream, peer: SocketAddr) {
    // Accepted sockets inherit non-blocking mode on some platforms.
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(session = %ctx.session_id, %peer, error = %e, "could not configure connection");
        return;
    }

    let added = ctx.session.lock().add_connection(&stream);
    let conn_id = match added {
        Ok(id) => id,
        Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
            debug!(session = %ctx.session_id, %peer, "relay stopping, connection refused");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        Err(e) => {
            warn!(session = %ctx.session_id, %peer, error = %e, "could not admit connection");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    info!(session = %ctx.session_id, conn = %conn_id, %peer, "client connected");

    let reader_ctx = ctx.clone();
    let spawned = thread::Builder::new()
        .name(format!("huddle-reader-{}-{conn_id}", ctx.session_id))
        .spawn(move || reader_loop(reader_ctx, stream, conn_id));
    if let Err(e) = spawned {
        warn!(session = %ctx.session_id, conn = %conn_id, error = %e, "could not spawn reader");
        ctx.session.lock().remove_connection(conn_id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Disconnected,
}

/// Reader loop for a single connection. Runs in its own thread.
fn reader_loop(ctx: RelayContext, mut stream: TcpStream, conn_id: ConnectionId) {
    let _span = info_span!("connection", session = %ctx.session_id, conn = %conn_id).entered();
    let mut buf = vec![0u8; ctx.read_buffer_size];
    let mut state = ConnectionState::Connected;

    while state == ConnectionState::Connected {
        state = read_and_broadcast(&ctx, &mut stream, conn_id, &mut buf);
    }

    let remaining = {
        let mut session = ctx.session.lock();
        session.remove_connection(conn_id);
        session.connection_count()
    };
    let _ = stream.shutdown(Shutdown::Both);
    info!(remaining, "client disconnected");

    if let (0, Some(hook)) = (remaining, &ctx.on_empty) {
        hook(ctx.session_id);
    }
}

fn read_and_broadcast(
    ctx: &RelayContext,
    stream: &mut TcpStream,
    conn_id: ConnectionId,
    buf: &mut [u8],
) -> ConnectionState {
    match stream.read(buf) {
        Ok(0) => ConnectionState::Disconnected,
        Ok(n) => {
            let report = ctx.session.lock().broadcast(conn_id, &buf[..n]);
            debug!(
                bytes = n,
                queued = report.queued,
                evicted = report.evicted,
                "relayed chunk"
            );
            ConnectionState::Connected
        }
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ConnectionState::Connected,
        Err(e) => {
            debug!(error = %e, "read failed");
            ConnectionState::Disconnected
        }
    }
}
