//! Worker side of the stdio binding.
//!
//! Serves a [`HandlerTable`] on a reader/writer pair (normally the process's
//! stdin/stdout), answering the reserved `health` request and stopping on the
//! `shutdown` notification or EOF.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::rpc::{
    EngineConfig, HandlerError, HandlerTable, Peer, RegistrationError, RpcEngine, RpcError,
};
use crate::state::HealthReport;

pub const HEALTH_METHOD: &str = "health";
pub const SHUTDOWN_METHOD: &str = "shutdown";

pub struct StdioWorker {
    handlers: HandlerTable,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl StdioWorker {
    /// Adds `health` (answering `{"ok":true}`) unless `handlers` already has
    /// one. `shutdown` is reserved.
    pub fn new(mut handlers: HandlerTable) -> Result<Self, RegistrationError> {
        if handlers.contains(SHUTDOWN_METHOD) {
            return Err(RegistrationError::Reserved(SHUTDOWN_METHOD.to_string()));
        }
        if !handlers.contains(HEALTH_METHOD) {
            handlers.register_request(HEALTH_METHOD, |_cx, _params: Value| async {
                Ok::<_, HandlerError>(HealthReport::ok())
            })?;
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        handlers.register_notification(SHUTDOWN_METHOD, move |_cx, _params: Value| {
            let token = token.clone();
            async move {
                tracing::info!("Shutdown requested");
                token.cancel();
            }
        })?;

        Ok(Self {
            handlers,
            config: EngineConfig::default(),
            shutdown,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancelled when the host asks for shutdown. Cancelling it locally also
    /// ends [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until shutdown or EOF. `on_start` receives a [`Peer`] for
    /// calling back into the host outside any handler.
    pub async fn run_with<R, W, F>(self, reader: R, writer: W, on_start: F) -> Result<(), RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(Peer),
    {
        let engine = RpcEngine::with_config(reader, writer, self.handlers, self.config);
        on_start(engine.peer());
        tracing::debug!("Worker serving");

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = engine.closed() => tracing::debug!("Host closed the stream"),
        }
        engine.close().await
    }

    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<(), RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.run_with(reader, writer, |_| {}).await
    }

    /// Serve on this process's stdin/stdout.
    pub async fn run_stdio(self) -> Result<(), RpcError> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }
}
