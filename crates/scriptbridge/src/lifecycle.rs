//! Stdio bridge lifecycle.
//!
//! Flow:
//! 1. Spawn the worker, hand its stdin/stdout to an [`RpcEngine`]
//! 2. Call `health` with a timeout, raced against process exit
//! 3. Serve calls while `Healthy`; a monitor flips the state to `Failed` if
//!    the stream closes without a shutdown request
//! 4. Stop: notify `shutdown`, close stdin, wait with a timeout, kill on expiry

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BridgeError, ExitPhase};
use crate::rpc::{EngineConfig, HandlerError, HandlerTable, RequestContext, RpcEngine, RpcError};
use crate::state::{BridgeState, HealthReport};
use crate::supervisor::{Binding, LaunchSpec, ProcessSupervisor, WorkerProcess};

pub const HEALTH_TIMEOUT_ENV: &str = "SCRIPTBRIDGE_HEALTH_TIMEOUT_SECS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "SCRIPTBRIDGE_SHUTDOWN_TIMEOUT_SECS";

pub(crate) fn env_duration(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on the startup `health` call.
    pub health_timeout: Duration,
    /// How long a worker gets to exit after `shutdown` before it is killed.
    pub shutdown_timeout: Duration,
    /// After the stream closes during startup, how long to wait for the
    /// exit status so the failure can be reported as an exit.
    pub exit_grace: Duration,
    pub engine: EngineConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            exit_grace: Duration::from_secs(1),
            engine: EngineConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SCRIPTBRIDGE_HEALTH_TIMEOUT_SECS` and
    /// `SCRIPTBRIDGE_SHUTDOWN_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_duration(HEALTH_TIMEOUT_ENV) {
            config.health_timeout = timeout;
        }
        if let Some(timeout) = env_duration(SHUTDOWN_TIMEOUT_ENV) {
            config.shutdown_timeout = timeout;
        }
        config
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

/// How the worker ended after `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub status: ExitStatus,
}

impl ExitReport {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Shared state cell; the monitor task holds a clone.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<BridgeState>>,
    bridge_id: Uuid,
}

impl StateCell {
    pub(crate) fn new(bridge_id: Uuid) -> Self {
        let (tx, _rx) = watch::channel(BridgeState::Unstarted);
        Self {
            tx: Arc::new(tx),
            bridge_id,
        }
    }

    pub(crate) fn get(&self) -> BridgeState {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self, next: BridgeState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            if !prev.can_transition_to(next) {
                tracing::debug!(
                    bridge_id = %self.bridge_id,
                    from = %prev,
                    to = %next,
                    "Unusual state transition"
                );
            }
            tracing::info!(
                bridge_id = %self.bridge_id,
                from = %prev,
                to = %next,
                "Bridge state changed"
            );
        }
    }

    /// Move `from -> to` only if still in `from`.
    pub(crate) fn transition_if(&self, from: BridgeState, to: BridgeState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(
                bridge_id = %self.bridge_id,
                from = %from,
                to = %to,
                "Bridge state changed"
            );
        }
        changed
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.tx.subscribe()
    }
}

/// One worker driven over JSON-RPC on its stdin/stdout.
pub struct Bridge {
    id: Uuid,
    spec: LaunchSpec,
    config: BridgeConfig,
    supervisor: ProcessSupervisor,
    handlers: HandlerTable,
    state: StateCell,
    shutdown_requested: Arc<AtomicBool>,
    lost_connection: Arc<AtomicBool>,
    process: Option<WorkerProcess>,
    engine: Option<RpcEngine>,
    monitor: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(spec: LaunchSpec) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            spec,
            config: BridgeConfig::default(),
            supervisor: ProcessSupervisor::default(),
            handlers: HandlerTable::new(),
            state: StateCell::new(id),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            lost_connection: Arc::new(AtomicBool::new(false)),
            process: None,
            engine: None,
            monitor: None,
        }
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a supervisor (and its config lookup cache) between bridges.
    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Methods the worker may call on this side.
    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register a method the worker may call. Only before `start`.
    pub fn register_request<P, R, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), BridgeError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.expect_state(BridgeState::Unstarted, "register a handler")?;
        Ok(self.handlers.register_request(method, handler)?)
    }

    /// Register a notification the worker may send. Only before `start`.
    pub fn register_notification<P, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), BridgeError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.expect_state(BridgeState::Unstarted, "register a handler")?;
        Ok(self.handlers.register_notification(method, handler)?)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(WorkerProcess::pid)
    }

    /// The engine, once started.
    pub fn engine(&self) -> Option<&RpcEngine> {
        self.engine.as_ref()
    }

    fn expect_state(
        &self,
        expected: BridgeState,
        operation: &'static str,
    ) -> Result<(), BridgeError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(BridgeError::InvalidState { state, operation })
        }
    }

    /// Spawn the worker and wait until it answers `health`.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.expect_state(BridgeState::Unstarted, "start")?;
        self.state.set(BridgeState::Starting);

        match self.launch().await {
            Ok(()) => {
                tracing::info!(bridge_id = %self.id, pid = self.pid(), "Worker healthy");
                self.state.set(BridgeState::Healthy);
                self.spawn_monitor();
                Ok(())
            }
            Err(e) => {
                tracing::error!(bridge_id = %self.id, error = %e, "Worker failed to start");
                self.state.set(BridgeState::Failed);
                if let Some(process) = self.process.as_mut() {
                    if let Err(kill_err) = process.kill().await {
                        tracing::warn!(
                            bridge_id = %self.id,
                            error = %kill_err,
                            "Failed to kill worker"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<(), BridgeError> {
        let mut process = self.supervisor.spawn(&self.spec, Binding::Stdio)?;
        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;
        let handlers = std::mem::take(&mut self.handlers);
        let engine = RpcEngine::with_config(stdout, stdin, handlers, self.config.engine.clone());

        let result = probe_health(&engine, &mut process, &self.config).await;
        self.process = Some(process);
        self.engine = Some(engine);
        result
    }

    fn spawn_monitor(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };
        let peer = engine.peer();
        let state = self.state.clone();
        let shutdown_requested = Arc::clone(&self.shutdown_requested);
        let lost_connection = Arc::clone(&self.lost_connection);
        let bridge_id = self.id;

        self.monitor = Some(tokio::spawn(async move {
            peer.closed().await;
            if shutdown_requested.load(Ordering::SeqCst) {
                return;
            }
            if state.transition_if(BridgeState::Healthy, BridgeState::Failed) {
                lost_connection.store(true, Ordering::SeqCst);
                tracing::error!(%bridge_id, "Worker connection closed unexpectedly");
            }
        }));
    }

    fn ready_engine(&self, operation: &'static str) -> Result<&RpcEngine, BridgeError> {
        let state = self.state();
        match &self.engine {
            Some(engine) if state == BridgeState::Healthy => Ok(engine),
            _ => Err(BridgeError::InvalidState { state, operation }),
        }
    }

    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        Ok(self.ready_engine("call")?.call(method, params).await?)
    }

    pub async fn call_with_cancel<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        Ok(self
            .ready_engine("call")?
            .call_with_cancel(cancel, method, params)
            .await?)
    }

    pub async fn call_timeout<P, R>(
        &self,
        timeout: Duration,
        method: &str,
        params: P,
    ) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        Ok(self
            .ready_engine("call")?
            .call_timeout(timeout, method, params)
            .await?)
    }

    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), BridgeError> {
        Ok(self.ready_engine("notify")?.notify(method, params).await?)
    }

    /// Graceful stop. Any exit status after the shutdown request is
    /// accepted; the worker is killed if it outlives `shutdown_timeout`.
    pub async fn stop(&mut self) -> Result<ExitReport, BridgeError> {
        match self.state() {
            BridgeState::Healthy => {}
            BridgeState::Failed => return self.reap_failed().await,
            state => return Err(BridgeError::InvalidState { state, operation: "stop" }),
        }

        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.state.set(BridgeState::ShuttingDown);

        let (Some(engine), Some(process)) = (self.engine.as_ref(), self.process.as_mut()) else {
            self.state.set(BridgeState::Stopped);
            return Err(BridgeError::InvalidState {
                state: BridgeState::ShuttingDown,
                operation: "stop",
            });
        };

        if let Err(e) = engine.notify("shutdown", ()).await {
            tracing::warn!(
                bridge_id = %self.id,
                error = %e,
                "Failed to send shutdown notification"
            );
        }
        if let Err(e) = engine.close().await {
            tracing::debug!(bridge_id = %self.id, error = %e, "Failed to close worker stdin");
        }

        let timeout = self.config.shutdown_timeout;
        let result = match tokio::time::timeout(timeout, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(bridge_id = %self.id, %status, "Worker exited after shutdown");
                Ok(ExitReport { status })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(bridge_id = %self.id, ?timeout, "Worker ignored shutdown, killing");
                if let Err(e) = process.kill().await {
                    tracing::warn!(bridge_id = %self.id, error = %e, "Failed to kill worker");
                }
                Err(BridgeError::ShutdownTimeout(timeout))
            }
        };

        self.state.set(BridgeState::Stopped);
        result
    }

    async fn reap_failed(&mut self) -> Result<ExitReport, BridgeError> {
        let Some(process) = self.process.as_mut() else {
            return Err(BridgeError::InvalidState {
                state: BridgeState::Failed,
                operation: "stop",
            });
        };
        let status = process.kill().await?;
        if self.lost_connection.load(Ordering::SeqCst) {
            return Err(BridgeError::WorkerExited {
                status,
                phase: ExitPhase::Running,
            });
        }
        Ok(ExitReport { status })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

async fn probe_health(
    engine: &RpcEngine,
    process: &mut WorkerProcess,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    let timeout = config.health_timeout;
    tracing::debug!(?timeout, "Waiting for worker health");

    let outcome = tokio::select! {
        result = engine.call_timeout::<_, HealthReport>(timeout, "health", ()) => result,
        status = process.wait() => {
            return Err(BridgeError::WorkerExited { status: status?, phase: ExitPhase::Startup });
        }
    };

    match outcome {
        Ok(report) if report.ok => Ok(()),
        Ok(_) => Err(BridgeError::Unhealthy),
        Err(RpcError::Timeout(_)) => Err(BridgeError::HealthTimeout(timeout)),
        Err(e) if e.is_transport() => {
            // The stream usually closes just before the exit is observed.
            match tokio::time::timeout(config.exit_grace, process.wait()).await {
                Ok(status) => Err(BridgeError::WorkerExited {
                    status: status?,
                    phase: ExitPhase::Startup,
                }),
                Err(_) => Err(BridgeError::HealthCheck(e)),
            }
        }
        Err(e) => Err(BridgeError::HealthCheck(e)),
    }
}
