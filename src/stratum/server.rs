/// Stratum TCP server: accept loops, optional TLS, per-connection session
/// tasks and the broadcast fan-out primitive.
///
/// Requests on one connection dispatch in arrival order; the handler may
/// suspend freely without blocking other connections. The connections map
/// lock is held only to insert/remove/snapshot.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::banning::BanManager;
use crate::config::{PoolConfig, StratumEndpointConfig};
use crate::stratum::connection::StratumConnection;
use crate::stratum::protocol::StratumRequest;

/// Inbound lines longer than this are protocol violations.
const MAX_LINE_LENGTH: usize = 8192;

/// Socket errors that are routine peer behavior, not worth a warning.
#[cfg(unix)]
const IGNORED_SOCKET_ERRNOS: &[i32] = &[
    32,  // EPIPE
    103, // ECONNABORTED
    104, // ECONNRESET
    110, // ETIMEDOUT
    125, // ECANCELED
];

#[cfg(windows)]
const IGNORED_SOCKET_ERRNOS: &[i32] = &[
    995,   // WSA_OPERATION_ABORTED
    10053, // WSAECONNABORTED
    10054, // WSAECONNRESET
    10060, // WSAETIMEDOUT
];

pub(crate) fn is_ignored_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    ) || e
        .raw_os_error()
        .map_or(false, |code| IGNORED_SOCKET_ERRNOS.contains(&code))
}

/// An inbound request wrapped with its arrival timestamp.
pub struct TimestampedRequest {
    pub request: StratumRequest,
    pub received: Instant,
}

/// Dispatch seam owned by the pool layer.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, conn: &Arc<StratumConnection>, request: TimestampedRequest);

    async fn on_connected(&self, _conn: &Arc<StratumConnection>) {}

    async fn on_disconnected(&self, _connection_id: &str) {}
}

pub struct StratumServer {
    pool_id: String,
    config: Arc<PoolConfig>,
    bans: Arc<BanManager>,
    connections: RwLock<HashMap<String, Arc<StratumConnection>>>,
}

impl StratumServer {
    pub fn new(config: Arc<PoolConfig>, bans: Arc<BanManager>) -> Self {
        Self {
            pool_id: config.id.clone(),
            config,
            bans,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot under the lock, act outside it.
    pub async fn for_each_connection(&self, action: impl Fn(&Arc<StratumConnection>)) {
        let snapshot: Vec<Arc<StratumConnection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in &snapshot {
            action(conn);
        }
    }

    /// Bind every configured endpoint and serve until cancellation.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn RequestHandler>,
        ct: CancellationToken,
    ) -> anyhow::Result<()> {
        if self.config.endpoints.is_empty() {
            anyhow::bail!("no stratum endpoints configured");
        }

        for endpoint in self.config.endpoints.clone() {
            let listener = bind_listener(&endpoint)?;
            let tls = match (&endpoint.tls_pfx_file, &endpoint.tls_pfx_password) {
                (Some(path), password) => Some(tls_acceptor(
                    path,
                    password.as_deref().unwrap_or(""),
                )?),
                _ => None,
            };
            tracing::info!(
                pool = %self.pool_id,
                "🌐 stratum listening on {}:{}{}",
                endpoint.host,
                endpoint.port,
                if tls.is_some() { " (tls)" } else { "" }
            );

            let server = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let ct = ct.clone();
            tokio::spawn(async move {
                server.accept_loop(listener, tls, handler, ct).await;
            });
        }

        ct.cancelled().await;
        self.for_each_connection(|conn| conn.disconnect()).await;
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<tokio_native_tls::TlsAcceptor>,
        handler: Arc<dyn RequestHandler>,
        ct: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = ct.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(pool = %self.pool_id, "accept failed: {}", e);
                    continue;
                }
            };

            if self.bans.is_banned(peer_addr.ip()).await {
                tracing::debug!(pool = %self.pool_id, "rejecting banned peer {}", peer_addr);
                continue;
            }

            let server = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let tls = tls.clone();
            let ct = ct.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => {
                            server.handle_session(stream, peer_addr, handler, ct).await
                        }
                        Err(e) => {
                            tracing::warn!(
                                pool = %server.pool_id,
                                "tls handshake with {} failed: {}", peer_addr, e
                            );
                            server
                                .bans
                                .ban(
                                    peer_addr.ip(),
                                    Duration::from_secs(server.config.ban_duration_secs),
                                )
                                .await;
                        }
                    },
                    None => server.handle_session(socket, peer_addr, handler, ct).await,
                }
            });
        }
    }

    async fn handle_session<S>(
        self: Arc<Self>,
        stream: S,
        peer_addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        ct: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let conn = Arc::new(StratumConnection::new(
            Uuid::new_v4().to_string(),
            peer_addr,
            outbound_tx,
            self.config.initial_difficulty,
        ));

        {
            let mut connections = self.connections.write().await;
            connections.insert(conn.id().to_string(), Arc::clone(&conn));
        }
        tracing::debug!(pool = %self.pool_id, conn = %conn.id(), "🔌 connection from {}", peer_addr);
        handler.on_connected(&conn).await;

        // Writer task: the only place the socket is written.
        let writer_closed = conn.closed().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            if write_half.write_all(message.as_bytes()).await.is_err() {
                                break;
                            }
                            if write_half.flush().await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.read_loop(read_half, &conn, &handler, &ct).await;

        conn.disconnect();
        {
            let mut connections = self.connections.write().await;
            connections.remove(conn.id());
        }
        handler.on_disconnected(conn.id()).await;
        tracing::debug!(pool = %self.pool_id, conn = %conn.id(), "connection closed");
    }

    async fn read_loop<R>(
        &self,
        read_half: R,
        conn: &Arc<StratumConnection>,
        handler: &Arc<dyn RequestHandler>,
        ct: &CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(read_half);
        let mut line = String::with_capacity(1024);

        loop {
            line.clear();
            let read = tokio::select! {
                _ = ct.cancelled() => break,
                _ = conn.closed().cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => break, // EOF
                Ok(n) if n > MAX_LINE_LENGTH => {
                    self.punish_junk(conn, "oversized line").await;
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    conn.touch();
                    match serde_json::from_str::<StratumRequest>(trimmed) {
                        Ok(request) => {
                            handler
                                .on_request(
                                    conn,
                                    TimestampedRequest {
                                        request,
                                        received: Instant::now(),
                                    },
                                )
                                .await;
                        }
                        Err(e) => {
                            self.punish_junk(conn, &format!("unparseable json: {}", e)).await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    if is_ignored_socket_error(&e) {
                        tracing::debug!(conn = %conn.id(), "socket closed: {}", e);
                    } else {
                        tracing::warn!(conn = %conn.id(), "read error: {}", e);
                    }
                    break;
                }
            }
        }
    }

    async fn punish_junk(&self, conn: &Arc<StratumConnection>, reason: &str) {
        tracing::warn!(
            pool = %self.pool_id,
            conn = %conn.id(),
            "protocol violation from {}: {}", conn.remote_addr(), reason
        );
        if self.config.ban_on_junk_receive {
            self.bans
                .ban(
                    conn.remote_addr().ip(),
                    Duration::from_secs(self.config.ban_duration_secs),
                )
                .await;
        }
    }
}

fn bind_listener(endpoint: &StratumEndpointConfig) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", endpoint.host, endpoint.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid endpoint {}:{}: {}", endpoint.host, endpoint.port, e))?;

    // SO_REUSEADDR so restarts do not trip over TIME_WAIT sockets.
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Acceptors are cached process-wide by certificate path.
static TLS_ACCEPTORS: OnceLock<std::sync::Mutex<HashMap<String, tokio_native_tls::TlsAcceptor>>> =
    OnceLock::new();

fn tls_acceptor(path: &str, password: &str) -> anyhow::Result<tokio_native_tls::TlsAcceptor> {
    let cache = TLS_ACCEPTORS.get_or_init(Default::default);
    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(acceptor) = cache.get(path) {
        return Ok(acceptor.clone());
    }

    let der = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("cannot read certificate {}: {}", path, e))?;
    let identity = tokio_native_tls::native_tls::Identity::from_pkcs12(&der, password)?;
    let acceptor = tokio_native_tls::native_tls::TlsAcceptor::builder(identity).build()?;
    let acceptor = tokio_native_tls::TlsAcceptor::from(acceptor);
    cache.insert(path.to_string(), acceptor.clone());
    Ok(acceptor)
}
