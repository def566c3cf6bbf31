//! PostgreSQL connection implementation.
//!
//! A [`Connection`] is a cheap, cloneable handle to a driver task that owns
//! the socket and the protocol [`Session`]. This module handles:
//! - TCP, Unix-socket and TLS connection establishment
//! - Feeding socket data to the session and writing its output
//! - Delivering results and reporting lifecycle events to an observer
//!
//! Callers submit requests over an unbounded channel and get results back on
//! oneshot channels, so any number of tasks can pipeline queries on one
//! connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::codec::{FrameDecoder, MessageWriter};
use super::error::{PgError, PgResult};
use super::protocol::{FrontendMessage, SslRequest, TransactionStatus};
use super::session::{Expect, Request, Session, SessionEvent, SessionOptions};
use super::tls;
use crate::config::{DbConfig, SslMode};
use crate::notify::Notification;
use crate::query::Query;
use crate::result::QueryResult;
use crate::schema::SchemaRegistry;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Connection Configuration
// ============================================================================

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Host name resolved at connect time
    Host(String, u16),
    /// Pre-resolved address
    Addr(SocketAddr),
    /// Unix-domain socket path
    Unix(PathBuf),
}

/// Which class of connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Primary,
    /// Connected to one resolved standby address
    Standby(SocketAddr),
    /// The dedicated notification connection
    Main,
}

/// Settings shared by every connection of a pool.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub session: SessionOptions,
    pub sslmode: SslMode,
    pub tls: Option<Arc<ClientConfig>>,
}

impl ConnectOptions {
    pub fn from_config(config: &DbConfig) -> Self {
        let tls = match config.sslmode() {
            SslMode::Disable => None,
            _ => match tls::client_config(config.check_certificate()) {
                Ok(tls) => Some(tls),
                Err(e) => {
                    warn!("TLS unavailable: {}", e);
                    None
                }
            },
        };

        Self {
            session: config.session_options(),
            sslmode: config.sslmode(),
            tls,
        }
    }
}

/// Endpoint plus the host name used for TLS.
#[derive(Debug, Clone)]
pub struct Target {
    pub endpoint: Endpoint,
    pub server_name: String,
}

impl Target {
    /// Primary target for a configuration.
    pub fn primary(config: &DbConfig) -> Self {
        let endpoint = match config.socket() {
            Some(path) => Endpoint::Unix(PathBuf::from(path)),
            None => Endpoint::Host(config.host().to_string(), config.port()),
        };
        Self {
            endpoint,
            server_name: config.host().to_string(),
        }
    }

    /// A resolved standby address.
    pub fn standby(config: &DbConfig, addr: SocketAddr) -> Self {
        Self {
            endpoint: Endpoint::Addr(addr),
            server_name: config
                .standby_host()
                .unwrap_or(config.host())
                .to_string(),
        }
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Lifecycle hooks, called from the connection's driver task.
///
/// Implementations must not block; none of them are called with connection
/// state locked.
pub trait ConnectionObserver: Send + Sync {
    /// Startup completed.
    fn on_connect(&self, _conn: &Connection) {}
    /// Nothing in flight and no lock held.
    fn on_idle(&self, _conn: &Connection) {}
    /// The connection is gone for good.
    fn on_destroy(&self, _conn: &Connection) {}
    fn on_notification(&self, _conn: &Connection, _notification: &Notification) {}
}

// ============================================================================
// Connection
// ============================================================================

enum Command {
    Submit(Request),
    Destroy,
}

#[derive(Debug, Default)]
struct ConnState {
    /// Nesting depth of begin/lock
    lock_count: usize,
    /// Requests submitted and not yet completed
    in_flight: usize,
    tx_status: TransactionStatus,
    connected: bool,
    destroyed: bool,
    /// Idle has been reported and nothing happened since
    idle: bool,
}

struct ConnectionInner {
    id: u64,
    kind: ConnectionKind,
    tx: Option<mpsc::UnboundedSender<Command>>,
    state: Mutex<ConnState>,
    observer: Option<Weak<dyn ConnectionObserver>>,
}

/// Handle to one PostgreSQL connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Connection {
    /// Start a connection: spawns its driver task and returns at once.
    ///
    /// Requests submitted before startup completes are sent right after it.
    pub fn spawn(
        kind: ConnectionKind,
        target: Target,
        options: Arc<ConnectOptions>,
        schema: Arc<SchemaRegistry>,
        observer: Option<Weak<dyn ConnectionObserver>>,
    ) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                tx: Some(tx),
                state: Mutex::new(ConnState::default()),
                observer,
            }),
        };

        let session = Session::new(conn.id(), options.session.clone(), schema);
        tokio::spawn(drive(conn.clone(), session, rx, target, options));
        conn
    }

    /// A connection that is already destroyed. Every query on it resolves
    /// as connection-closed.
    pub fn destroyed() -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                id: 0,
                kind: ConnectionKind::Primary,
                tx: None,
                state: Mutex::new(ConnState {
                    destroyed: true,
                    ..Default::default()
                }),
                observer: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        state.connected && !state.destroyed
    }

    pub fn tx_status(&self) -> TransactionStatus {
        self.inner.state.lock().tx_status
    }

    pub fn lock_count(&self) -> usize {
        self.inner.state.lock().lock_count
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Submit a request. Returns false, dropping it, if the connection is gone.
    pub fn submit(&self, req: Request) -> bool {
        let Some(tx) = &self.inner.tx else {
            return false;
        };

        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return false;
            }
            state.in_flight += 1;
            state.idle = false;
        }

        if tx.send(Command::Submit(req)).is_err() {
            let mut state = self.inner.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            return false;
        }
        true
    }

    /// Run a query and wait for its result.
    pub async fn query(&self, query: Query, expect: Expect) -> QueryResult {
        let (tx, rx) = oneshot::channel();
        if !self.submit(Request::new(query, expect, tx)) {
            return QueryResult::connection_closed();
        }
        rx.await.unwrap_or_else(|_| QueryResult::connection_closed())
    }

    /// Take one level of exclusive use.
    pub fn acquire_lock(&self) {
        let mut state = self.inner.state.lock();
        state.lock_count += 1;
        state.idle = false;
    }

    /// Release one level of exclusive use; the connection may go idle.
    pub fn release_lock(&self) {
        {
            let mut state = self.inner.state.lock();
            state.lock_count = state.lock_count.saturating_sub(1);
        }
        self.check_idle();
    }

    /// Mark the connection as handed out, so a stale idle report is not reused.
    pub(crate) fn mark_busy(&self) {
        self.inner.state.lock().idle = false;
    }

    /// Destroy the connection. Outstanding requests resolve as connection-closed.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        if let Some(tx) = &self.inner.tx {
            let _ = tx.send(Command::Destroy);
        }
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.inner.observer.as_ref().and_then(Weak::upgrade)
    }

    fn check_idle(&self) {
        let fire = {
            let mut state = self.inner.state.lock();
            let ready = state.connected
                && !state.destroyed
                && !state.idle
                && state.in_flight == 0
                && state.lock_count == 0;
            if ready {
                state.idle = true;
            }
            ready
        };

        if fire {
            trace!(conn = self.id(), "idle");
            if let Some(observer) = self.observer() {
                observer.on_idle(self);
            }
        }
    }

    /// Hand completed requests back and report session events.
    fn dispatch(&self, session: &mut Session) {
        let completions = session.take_completions();
        let events = session.drain_events();

        {
            let mut state = self.inner.state.lock();
            state.tx_status = session.tx_status();
            state.in_flight = state.in_flight.saturating_sub(completions.len());
            if events.contains(&SessionEvent::Connected) {
                state.connected = true;
            }
        }

        for completion in completions {
            completion.deliver();
        }

        for event in events {
            match event {
                SessionEvent::Connected => {
                    if let Some(observer) = self.observer() {
                        observer.on_connect(self);
                    }
                    // A connection whose caller went away before submitting
                    self.check_idle();
                }
                SessionEvent::Idle => self.check_idle(),
                SessionEvent::Notification(n) => {
                    if let Some(observer) = self.observer() {
                        observer.on_notification(self, &n);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Stream = Box<dyn Transport>;

/// Why the driver loop stopped.
enum Exit {
    Destroyed,
    Closed,
    Failed(PgError),
}

async fn drive(
    conn: Connection,
    mut session: Session,
    mut rx: mpsc::UnboundedReceiver<Command>,
    target: Target,
    options: Arc<ConnectOptions>,
) {
    // Keep accepting requests while the socket opens
    let opening = open_stream(&target, &options);
    tokio::pin!(opening);

    let opened = loop {
        tokio::select! {
            res = &mut opening => break Some(res),
            cmd = rx.recv() => match cmd {
                Some(Command::Submit(req)) => session.enqueue(req),
                Some(Command::Destroy) | None => break None,
            },
        }
    };

    let (mut stream, exit) = match opened {
        Some(Ok(mut stream)) => {
            session.start();
            let exit = run(&conn, &mut session, &mut rx, &mut stream).await;
            (Some(stream), exit)
        }
        Some(Err(e)) => (None, Exit::Failed(e)),
        None => (None, Exit::Destroyed),
    };

    match &exit {
        Exit::Destroyed => debug!(conn = conn.id(), "connection destroyed"),
        Exit::Closed => debug!(conn = conn.id(), "connection closed by server"),
        Exit::Failed(e) => warn!(conn = conn.id(), endpoint = ?target.endpoint, "connection failed: {}", e),
    }

    // Terminal: no further socket I/O apart from a best-effort Terminate
    session.destroy();
    if let Some(stream) = stream.as_mut() {
        if matches!(exit, Exit::Destroyed) && session.has_output() {
            let _ = stream.write_all(&session.take_output()).await;
        }
        let _ = stream.shutdown().await;
    }

    conn.inner.state.lock().destroyed = true;
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if let Command::Submit(req) = cmd {
            session.enqueue(req);
        }
    }
    conn.dispatch(&mut session);

    if let Some(observer) = conn.observer() {
        observer.on_destroy(&conn);
    }
}

async fn run(
    conn: &Connection,
    session: &mut Session,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    stream: &mut Stream,
) -> Exit {
    let mut decoder = FrameDecoder::new();

    loop {
        if session.has_output() {
            if let Err(e) = stream.write_all(&session.take_output()).await {
                return Exit::Failed(e.into());
            }
        }
        conn.dispatch(session);

        decoder.buffer_mut().reserve(8 * 1024);
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Submit(req)) => session.enqueue(req),
                Some(Command::Destroy) | None => return Exit::Destroyed,
            },
            read = stream.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => return Exit::Closed,
                Ok(_) => {
                    if let Err(e) = feed(session, &mut decoder) {
                        return Exit::Failed(e);
                    }
                }
                Err(e) => return Exit::Failed(e.into()),
            },
        }
    }
}

/// Pass every complete buffered frame to the session.
fn feed(session: &mut Session, decoder: &mut FrameDecoder) -> PgResult<()> {
    while let Some(frame) = decoder.next_frame()? {
        session.handle_message(frame.tag, frame.payload)?;
    }
    Ok(())
}

async fn open_stream(target: &Target, options: &ConnectOptions) -> PgResult<Stream> {
    let tcp = match &target.endpoint {
        Endpoint::Unix(path) => return open_unix(path).await,
        Endpoint::Host(host, port) => TcpStream::connect((host.as_str(), *port)).await?,
        Endpoint::Addr(addr) => TcpStream::connect(addr).await?,
    };
    tcp.set_nodelay(true)?;
    negotiate_tls(tcp, &target.server_name, options).await
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> PgResult<Stream> {
    Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
}

#[cfg(not(unix))]
async fn open_unix(_path: &std::path::Path) -> PgResult<Stream> {
    Err(PgError::Protocol(
        "Unix sockets are not supported on this platform".to_string(),
    ))
}

/// SSLRequest handshake.
///
/// 'S' upgrades to TLS; 'N' falls back to plain text unless TLS is required.
async fn negotiate_tls(
    mut tcp: TcpStream,
    server_name: &str,
    options: &ConnectOptions,
) -> PgResult<Stream> {
    if options.sslmode == SslMode::Disable {
        return Ok(Box::new(tcp));
    }

    let mut w = MessageWriter::new();
    SslRequest.write(&mut w);
    tcp.write_all(&w.take()).await?;

    // Exactly one byte: anything after it must come from the TLS layer
    let mut response = [0u8; 1];
    tcp.read_exact(&mut response).await?;

    match response[0] {
        b'S' => {
            let config = options
                .tls
                .clone()
                .ok_or_else(|| PgError::Tls("TLS is not configured".to_string()))?;
            let stream = TlsConnector::from(config)
                .connect(tls::server_name(server_name)?, tcp)
                .await
                .map_err(|e| PgError::Tls(e.to_string()))?;
            Ok(Box::new(stream))
        }
        b'N' if options.sslmode == SslMode::Require => {
            Err(PgError::Tls("Server does not support SSL".to_string()))
        }
        b'N' => Ok(Box::new(tcp)),
        other => Err(PgError::Protocol(format!(
            "Unexpected SSL response: 0x{:02x}",
            other
        ))),
    }
}
