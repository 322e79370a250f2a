//! Main application entry point

use hyper::header::HeaderMap;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto, graceful::GracefulShutdown},
};

use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    signal,
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    fs::DocumentRoots,
    handlers::{GatewayService, SessionSource},
    session::Session,
    tls::{is_tls_first_byte, TlsConfig},
};

pub(super) const GRACEFUL_SHUTDOWN_TIMEOUT: u64 = 10;
const DEFAULT_PORT: u16 = 9090;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REQUEST_SIZE: usize = 4096;
const DEFAULT_SOCKET_PATH: &str = "/cockpit/socket";

/// The gateway application: one listening port that terminates HTTPS (or
/// serves in clear), upgrades WebSockets onto sessions, fetches bridge
/// resources, and serves static files.
///
/// # Examples
/// ```no_run
/// use wheelhouse::Gateway;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     Gateway::new()
///         .bind("0.0.0.0:9090")
///         .with_document_root("/usr/share/gateway/static")
///         .run()
///         .await
/// }
/// ```
pub struct Gateway {
    /// TCP connection parameters
    connection: Connection,

    /// TLS configuration options; plaintext only when absent
    tls_config: Option<TlsConfig>,

    /// Directories static files are served from
    document_roots: Vec<PathBuf>,

    /// Per-request inactivity timeout
    ///
    /// Default: 30 seconds
    request_timeout: Duration,

    /// Accepted request head size; the per-connection input ceiling is
    /// twice this.
    ///
    /// Default: 4 KiB
    max_request_size: usize,

    /// Paths under this prefix are served in clear even when TLS is on
    ssl_exception_prefix: Option<String>,

    /// Path WebSocket upgrades attach to
    socket_path: String,

    /// Resolves requests to authenticated sessions
    sessions: Option<Arc<dyn SessionSource>>,
}

/// Wraps a socket
pub struct Connection {
    socket: SocketAddr,
}

impl Default for Connection {
    fn default() -> Self {
        let socket = ([0, 0, 0, 0], DEFAULT_PORT).into();
        Self { socket }
    }
}

impl From<&str> for Connection {
    fn from(s: &str) -> Self {
        if let Ok(socket) = s.parse::<SocketAddr>() {
            Self { socket }
        } else {
            Self::default()
        }
    }
}

impl<I: Into<IpAddr>> From<(I, u16)> for Connection {
    fn from(value: (I, u16)) -> Self {
        Self { socket: SocketAddr::from(value) }
    }
}

/// Contains the shared resources of a running gateway
pub(crate) struct GatewayEnv {
    pub(crate) roots: DocumentRoots,
    pub(crate) socket_path: String,
    pub(crate) max_request_size: usize,
    pub(crate) request_timeout: Duration,
    acceptor: Option<TlsAcceptor>,
    sessions: Option<Arc<dyn SessionSource>>,
    ssl_exception_prefix: Option<String>,
    graceful_shutdown: GracefulShutdown,
}

impl GatewayEnv {
    pub(crate) fn lookup(&self, headers: &HeaderMap) -> Option<Session> {
        self.sessions.as_ref().and_then(|sessions| sessions.lookup(headers))
    }

    pub(crate) fn ssl_exception(&self, path: &str) -> bool {
        self.ssl_exception_prefix
            .as_deref()
            .map(|prefix| path.starts_with(prefix))
            .unwrap_or(false)
    }

    /// Gracefully shutdown current instance
    #[inline]
    async fn shutdown(self) {
        tokio::select! {
            _ = self.graceful_shutdown.shutdown() => {
                tracing::info!("shutting down the server...");
            },
            _ = tokio::time::sleep(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT)) => {
                tracing::warn!("timed out wait for all connections to close");
            }
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    /// Initializes a new gateway, bound to 0.0.0.0:9090 by default.
    pub fn new() -> Self {
        Self {
            connection: Default::default(),
            tls_config: None,
            document_roots: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            ssl_exception_prefix: None,
            socket_path: DEFAULT_SOCKET_PATH.into(),
            sessions: None,
        }
    }

    /// Binds the gateway to the specified `socket` address.
    ///
    /// # Examples
    /// ```no_run
    /// use wheelhouse::Gateway;
    ///
    /// let gateway = Gateway::new().bind("127.0.0.1:9090");
    /// let gateway = Gateway::new().bind(([127, 0, 0, 1], 9090));
    /// ```
    pub fn bind<S: Into<Connection>>(mut self, socket: S) -> Self {
        self.connection = socket.into();
        self
    }

    /// Configures the gateway with specified TLS configuration.
    ///
    /// With TLS on, the first byte of every connection decides whether it
    /// is handshaken, redirected to HTTPS, or (from loopback) served in
    /// clear. Default: `None`
    pub fn with_tls(mut self, config: TlsConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Adds a directory static files are served from. Roots are resolved
    /// at startup; requests may not escape them.
    pub fn with_document_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_roots.push(path.into());
        self
    }

    /// Sets the per-request inactivity timeout.
    ///
    /// Default: 30 seconds
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the accepted request head size in bytes.
    ///
    /// Default: 4 KiB
    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    /// Paths under this prefix skip the HTTPS redirect, so health
    /// endpoints stay reachable in clear.
    pub fn with_ssl_exception_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ssl_exception_prefix = Some(prefix.into());
        self
    }

    /// Sets the path WebSocket upgrades attach to.
    ///
    /// Default: `/cockpit/socket`
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Plugs in the session lookup; without one every socket gets the
    /// no-auth close and resources answer 401.
    pub fn with_sessions(mut self, sessions: impl SessionSource) -> Self {
        self.sessions = Some(Arc::new(sessions));
        self
    }

    /// Runs the gateway.
    pub async fn run(self) -> io::Result<()> {
        let socket = self.connection.socket;
        let tcp_listener = TcpListener::bind(socket).await?;

        let acceptor = self.tls_config.as_ref().map(TlsConfig::build).transpose()?;
        if acceptor.is_some() {
            tracing::info!("listening on: https://{socket}");
        } else {
            tracing::info!("listening on: http://{socket}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let shutdown_tx = Arc::new(shutdown_tx);
        Self::shutdown_signal(shutdown_rx);

        let env = Arc::new(GatewayEnv {
            roots: DocumentRoots::new(&self.document_roots),
            socket_path: self.socket_path,
            max_request_size: self.max_request_size,
            request_timeout: self.request_timeout,
            acceptor,
            sessions: self.sessions,
            ssl_exception_prefix: self.ssl_exception_prefix,
            graceful_shutdown: GracefulShutdown::new(),
        });

        loop {
            let (stream, peer) = tokio::select! {
                Ok(connection) = tcp_listener.accept() => connection,
                _ = shutdown_tx.closed() => break,
            };
            let env = env.clone();
            tokio::spawn(Self::handle_connection(stream, peer, env));
        }

        drop(tcp_listener);

        if let Some(env) = Arc::into_inner(env) {
            env.shutdown().await;
        }
        Ok(())
    }

    #[inline]
    fn shutdown_signal(shutdown_rx: watch::Receiver<()>) {
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(_) => (),
                Err(err) => tracing::error!("unable to listen for shutdown signal: {err}"),
            }
            tracing::trace!("shutdown signal received, not accepting new requests");
            drop(shutdown_rx);
        });
    }

    /// Sniffs the first byte when TLS is configured: a client hello gets
    /// the handshake, anything else is served in clear, with the HTTPS
    /// redirect armed for non-loopback peers.
    async fn handle_connection(stream: TcpStream, peer: SocketAddr, env: Arc<GatewayEnv>) {
        let Some(acceptor) = env.acceptor.clone() else {
            return Self::serve(TokioIo::new(stream), env, false, false).await;
        };

        let mut first_byte = [0u8; 1];
        match stream.peek(&mut first_byte).await {
            Ok(0) => return,
            Ok(_) => (),
            Err(err) => {
                tracing::debug!("couldn't read first byte: {err}");
                return;
            }
        }

        if is_tls_first_byte(first_byte[0]) {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => Self::serve(TokioIo::new(tls_stream), env, false, true).await,
                // Expected handshake EOFs stay out of the logs.
                Err(err) => tracing::debug!("failed to perform tls handshake: {err}"),
            }
        } else {
            let redirect = !peer.ip().is_loopback();
            Self::serve(TokioIo::new(stream), env, redirect, false).await;
        }
    }

    async fn serve<I>(io: I, env: Arc<GatewayEnv>, redirect: bool, tls: bool)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let service = GatewayService { env: env.clone(), redirect, tls };

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(env.request_timeout)
            .max_buf_size((env.max_request_size * 2).max(8192));

        let connection = builder.serve_connection_with_upgrades(io, service);
        let connection = env.graceful_shutdown.watch(connection);
        if let Err(err) = connection.await {
            tracing::debug!("error serving connection: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_creates_connection_with_default_socket() {
        let connection = Connection::default();

        assert_eq!(connection.socket, SocketAddr::from(([0, 0, 0, 0], 9090)));
    }

    #[test]
    fn it_creates_connection_with_specified_socket() {
        let connection: Connection = "127.0.0.1:5000".into();

        assert_eq!(connection.socket, SocketAddr::from(([127, 0, 0, 1], 5000)));
    }

    #[test]
    fn it_creates_default_connection_from_empty_str() {
        let connection: Connection = "".into();

        assert_eq!(connection.socket, SocketAddr::from(([0, 0, 0, 0], 9090)));
    }

    #[test]
    fn it_creates_connection_with_specified_socket_from_tuple() {
        let connection: Connection = ([127, 0, 0, 1], 5000).into();

        assert_eq!(connection.socket, SocketAddr::from(([127, 0, 0, 1], 5000)));
    }

    #[test]
    fn it_binds_gateway_to_socket() {
        let gateway = Gateway::new().bind("127.0.0.1:5001");

        assert_eq!(gateway.connection.socket, SocketAddr::from(([127, 0, 0, 1], 5001)));
    }

    #[test]
    fn it_sets_default_request_limits() {
        let gateway = Gateway::new();

        assert_eq!(gateway.max_request_size, 4096);
        assert_eq!(gateway.request_timeout, Duration::from_secs(30));
        assert_eq!(gateway.socket_path, "/cockpit/socket");
    }

    #[test]
    fn it_overrides_request_limits() {
        let gateway = Gateway::new()
            .with_max_request_size(1024)
            .with_request_timeout(Duration::from_secs(5))
            .with_ssl_exception_prefix("/ping");

        assert_eq!(gateway.max_request_size, 1024);
        assert_eq!(gateway.request_timeout, Duration::from_secs(5));
        assert_eq!(gateway.ssl_exception_prefix.as_deref(), Some("/ping"));
    }
}
