//! Worker side of the secure binding: certificate exchange, then an axum
//! router served over rustls on a loopback port.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;

use super::cert::{self, EphemeralCert};
use super::handshake::{ServerHello, read_client_hello, write_server_hello};
use super::{CLIENT_CERT_HASH_HEADER, ClientAuth, HEALTH_PATH, SecureError};

const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKED_BACKLOG: usize = 64;

/// TLS config trusting exactly `client_pem` when TLS client auth is on.
pub(crate) fn server_tls_config(
    server: &EphemeralCert,
    client_pem: &str,
    auth: ClientAuth,
) -> Result<Arc<ServerConfig>, SecureError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if auth.verifies_tls() {
        let mut roots = RootCertStore::empty();
        roots.add(cert::parse_cert(client_pem)?)?;
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder.with_single_cert(vec![server.cert_der()?], server.key_der()?)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// TCP listener that completes TLS handshakes before handing connections
/// to axum. Each handshake runs on its own task so a stalled peer cannot
/// hold up the next connection. Failed handshakes are logged and skipped.
///
/// Must be created inside a Tokio runtime.
pub struct TlsListener {
    local_addr: SocketAddr,
    handshaked: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(tcp: TcpListener, config: Arc<ServerConfig>) -> io::Result<Self> {
        let local_addr = tcp.local_addr()?;
        let (tx, handshaked) = mpsc::channel(HANDSHAKED_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(tcp, TlsAcceptor::from(config), tx));
        Ok(Self {
            local_addr,
            handshaked,
            accept_task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, addr) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if tx.is_closed() {
            return;
        }
        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, addr)).await;
                }
                Ok(Err(e)) => tracing::debug!(%addr, error = %e, "TLS handshake rejected"),
                Err(_) => tracing::debug!(%addr, "TLS handshake timed out"),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.handshaked.recv().await {
            Some(accepted) => accepted,
            // The accept loop only ends once this listener is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn require_cert_hash(State(expected): State<Arc<str>>, req: Request, next: Next) -> Response {
    let matches = req
        .headers()
        .get(CLIENT_CERT_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|hash| hash.eq_ignore_ascii_case(&expected));
    match matches {
        Some(true) => next.run(req).await,
        Some(false) => {
            tracing::warn!(path = %req.uri().path(), "Client certificate hash mismatch");
            StatusCode::UNAUTHORIZED.into_response()
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "Missing client certificate hash");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Answers `GET /health` with 204 when the application has no such route.
/// Replaces any fallback the application set.
async fn fallback(method: Method, uri: Uri) -> StatusCode {
    if method == Method::GET && uri.path() == HEALTH_PATH {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Wrap an application router with the default health route and, when
/// enabled, the client certificate hash check.
pub(crate) fn secure_router(app: Router, client_pem: &str, auth: ClientAuth) -> Router {
    let router = app.fallback(fallback);
    if auth.verifies_header() {
        let expected: Arc<str> = cert::fingerprint(client_pem).into();
        router.layer(middleware::from_fn_with_state(expected, require_cert_hash))
    } else {
        router
    }
}

/// Worker-side server for the secure binding.
pub struct SecureServer {
    app: Router,
    auth: ClientAuth,
    shutdown: CancellationToken,
}

impl SecureServer {
    pub fn new(app: Router) -> Self {
        Self {
            app,
            auth: ClientAuth::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_client_auth(mut self, auth: ClientAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Stop serving when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Read the client certificate from `input` until EOF, announce the
    /// listening port and server certificate on `output`, then serve until
    /// shutdown.
    pub async fn run<R, W>(self, input: R, mut output: W) -> Result<(), SecureError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello = read_client_hello(input).await?;
        let server_cert = EphemeralCert::generate()?;
        let tls = server_tls_config(&server_cert, &hello.cert, self.auth)?;

        let tcp = TcpListener::bind(("127.0.0.1", 0)).await.map_err(SecureError::Bind)?;
        let addr = tcp.local_addr().map_err(SecureError::Bind)?;

        write_server_hello(
            &mut output,
            &ServerHello {
                port: addr.port(),
                cert: server_cert.cert_pem().to_string(),
            },
        )
        .await?;
        tracing::info!(%addr, auth = ?self.auth, "Secure worker listening");

        let router = secure_router(self.app, &hello.cert, self.auth);
        let listener = TlsListener::new(tcp, tls).map_err(SecureError::Bind)?;
        let shutdown = self.shutdown;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Secure worker stopped");
        Ok(())
    }
}

/// Serve `app` over the secure binding on the process's stdin/stdout.
pub async fn serve_secure(
    app: Router,
    auth: ClientAuth,
    shutdown: CancellationToken,
) -> Result<(), SecureError> {
    SecureServer::new(app)
        .with_client_auth(auth)
        .with_shutdown(shutdown)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}
