//! Lifecycle of a worker reached over the secure binding.

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cert::EphemeralCert;
use super::client::SecureClient;
use super::handshake::{HandshakeError, read_server_hello_timeout, write_client_hello};
use super::{SecureConfig, SecureError};
use crate::error::{BridgeError, ExitPhase};
use crate::lifecycle::{ExitReport, StateCell};
use crate::state::BridgeState;
use crate::supervisor::{
    Binding, LaunchSpec, ProcessSupervisor, SupervisorError, WorkerProcess, forward_lines,
};

/// How long to wait for an exit status once the worker's stdout hits EOF
/// mid-handshake.
const EXIT_GRACE: Duration = Duration::from_secs(1);

pub struct SecureBridge {
    id: Uuid,
    spec: LaunchSpec,
    config: SecureConfig,
    supervisor: ProcessSupervisor,
    state: StateCell,
    pid: Option<u32>,
    /// Held until healthy, then owned by the monitor.
    process: Option<WorkerProcess>,
    client: Option<SecureClient>,
    stdout_task: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<Result<ExitStatus, SupervisorError>>>,
    kill: CancellationToken,
    lost_worker: Arc<AtomicBool>,
}

impl SecureBridge {
    pub fn new(spec: LaunchSpec) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            spec,
            config: SecureConfig::default(),
            supervisor: ProcessSupervisor::default(),
            state: StateCell::new(id),
            pid: None,
            process: None,
            client: None,
            stdout_task: None,
            monitor: None,
            kill: CancellationToken::new(),
            lost_worker: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: SecureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
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
        self.pid
    }

    /// Spawn the worker, swap certificates and wait for `/health`.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let state = self.state();
        if state != BridgeState::Unstarted {
            return Err(BridgeError::InvalidState {
                state,
                operation: "start",
            });
        }
        self.state.set(BridgeState::Starting);

        let mut process = match self.supervisor.spawn(&self.spec, Binding::Secure) {
            Ok(process) => process,
            Err(e) => {
                self.state.set(BridgeState::Failed);
                return Err(e.into());
            }
        };
        self.pid = process.pid();

        match connect(&mut process, &self.config).await {
            Ok((client, stdout_task)) => {
                tracing::info!(
                    bridge_id = %self.id,
                    pid = self.pid,
                    url = %client.base_url(),
                    "Secure worker healthy"
                );
                self.client = Some(client);
                self.stdout_task = Some(stdout_task);
                self.state.set(BridgeState::Healthy);
                self.spawn_monitor(process);
                Ok(())
            }
            Err(e) => {
                tracing::error!(bridge_id = %self.id, error = %e, "Secure worker failed to start");
                if let Err(kill_err) = process.kill().await {
                    tracing::warn!(
                        bridge_id = %self.id,
                        error = %kill_err,
                        "Failed to kill worker"
                    );
                }
                self.process = Some(process);
                self.state.set(BridgeState::Failed);
                Err(e)
            }
        }
    }

    /// Wait for the worker to exit, or kill it once `stop` asks. An exit
    /// nobody asked for moves a healthy bridge to `Failed`.
    fn spawn_monitor(&mut self, mut process: WorkerProcess) {
        let state = self.state.clone();
        let kill = self.kill.clone();
        let lost_worker = Arc::clone(&self.lost_worker);
        let bridge_id = self.id;

        self.monitor = Some(tokio::spawn(async move {
            tokio::select! {
                status = process.wait() => {
                    if state.transition_if(BridgeState::Healthy, BridgeState::Failed) {
                        lost_worker.store(true, Ordering::SeqCst);
                        match &status {
                            Ok(status) => tracing::error!(
                                %bridge_id,
                                %status,
                                "Secure worker exited unexpectedly"
                            ),
                            Err(e) => tracing::error!(
                                %bridge_id,
                                error = %e,
                                "Lost track of secure worker"
                            ),
                        }
                    }
                    status
                }
                _ = kill.cancelled() => process.kill().await,
            }
        }));
    }

    /// The HTTPS client, while healthy.
    pub fn client(&self) -> Result<&SecureClient, BridgeError> {
        let state = self.state();
        match &self.client {
            Some(client) if state == BridgeState::Healthy => Ok(client),
            _ => Err(BridgeError::InvalidState {
                state,
                operation: "invoke",
            }),
        }
    }

    pub async fn invoke<P, R>(&self, operation: &str, params: P) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        Ok(self.client()?.invoke(operation, params).await?)
    }

    pub async fn invoke_stream<P: Serialize>(
        &self,
        operation: &str,
        params: P,
    ) -> Result<BoxStream<'static, Result<Value, SecureError>>, BridgeError> {
        Ok(self.client()?.invoke_stream(operation, params).await?)
    }

    pub async fn notify<P: Serialize>(
        &self,
        operation: &str,
        params: P,
    ) -> Result<(), BridgeError> {
        Ok(self.client()?.notify(operation, params).await?)
    }

    /// Kill the worker and reap it. The HTTP side has no shutdown message.
    ///
    /// After an unexpected exit the status is returned as
    /// [`BridgeError::WorkerExited`].
    pub async fn stop(&mut self) -> Result<ExitReport, BridgeError> {
        let state = self.state();
        match state {
            BridgeState::Healthy => self.state.set(BridgeState::ShuttingDown),
            BridgeState::Failed => {}
            _ => return Err(BridgeError::InvalidState { state, operation: "stop" }),
        }
        self.client = None;

        let status = self.reap().await;
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if state == BridgeState::Healthy {
            self.state.set(BridgeState::Stopped);
        }
        let status = status?;
        tracing::info!(bridge_id = %self.id, %status, "Secure worker stopped");

        if self.lost_worker.load(Ordering::SeqCst) {
            return Err(BridgeError::WorkerExited {
                status,
                phase: ExitPhase::Running,
            });
        }
        Ok(ExitReport { status })
    }

    async fn reap(&mut self) -> Result<ExitStatus, BridgeError> {
        if let Some(monitor) = self.monitor.take() {
            self.kill.cancel();
            return match monitor.await {
                Ok(status) => Ok(status?),
                Err(e) => Err(SupervisorError::Wait(std::io::Error::other(e)).into()),
            };
        }
        match self.process.as_mut() {
            Some(process) => Ok(process.kill().await?),
            None => Err(BridgeError::InvalidState {
                state: self.state(),
                operation: "stop",
            }),
        }
    }
}

impl Drop for SecureBridge {
    fn drop(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        // Dropping the process inside the monitor kills the worker.
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Handshake then readiness, each raced against the worker exiting.
async fn connect(
    process: &mut WorkerProcess,
    config: &SecureConfig,
) -> Result<(SecureClient, JoinHandle<()>), BridgeError> {
    let identity = EphemeralCert::generate()?;
    tracing::debug!(fingerprint = %identity.fingerprint(), "Generated client certificate");

    let stdin = process.take_stdin()?;
    let stdout = process.take_stdout()?;
    write_client_hello(stdin, identity.cert_pem())
        .await
        .map_err(SecureError::from)?;

    let mut reader = BufReader::new(stdout);
    let hello = tokio::select! {
        hello = read_server_hello_timeout(&mut reader, config.handshake_timeout) => hello,
        status = process.wait() => {
            return Err(BridgeError::WorkerExited { status: status?, phase: ExitPhase::Handshake });
        }
    };
    let hello = match hello {
        Ok(hello) => hello,
        Err(HandshakeError::Eof) => {
            return match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
                Ok(status) => Err(BridgeError::WorkerExited {
                    status: status?,
                    phase: ExitPhase::Handshake,
                }),
                Err(_) => Err(SecureError::from(HandshakeError::Eof).into()),
            };
        }
        Err(e) => return Err(SecureError::from(e).into()),
    };
    tracing::debug!(port = hello.port, "Handshake complete");

    let stdout_task = tokio::spawn(forward_lines(reader, process.pid()));
    let client = match SecureClient::new(hello.port, &hello.cert, &identity, config) {
        Ok(client) => client,
        Err(e) => {
            stdout_task.abort();
            return Err(e.into());
        }
    };

    let ready = tokio::select! {
        ready = client.wait_ready(config.health_timeout, config.poll_interval) => ready,
        status = process.wait() => {
            stdout_task.abort();
            return Err(BridgeError::WorkerExited { status: status?, phase: ExitPhase::Startup });
        }
    };
    if let Err(e) = ready {
        stdout_task.abort();
        return Err(e.into());
    }
    Ok((client, stdout_task))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::{ConfigFile, RuntimeCommand};

    fn sh_bridge(script: &str) -> SecureBridge {
        let spec = LaunchSpec::new("/unused/main.ts")
            .with_config(ConfigFile::Disabled)
            .with_runtime(RuntimeCommand::new("sh").with_args(["-c", script, "worker"]));
        SecureBridge::new(spec).with_config(
            SecureConfig::new()
                .with_handshake_timeout(Duration::from_millis(500))
                .with_health_timeout(Duration::from_millis(500)),
        )
    }

    #[tokio::test]
    async fn garbage_handshake_is_a_parse_error() {
        let mut bridge = sh_bridge("cat >/dev/null; echo 'not-a-handshake!!!!!'; sleep 30");
        let err = bridge.start().await.unwrap_err();
        assert!(
            matches!(
                err,
                BridgeError::Secure(SecureError::Handshake(HandshakeError::Parse { .. }))
            ),
            "{err:?}"
        );
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert!(bridge.stop().await.is_ok());
    }

    #[tokio::test]
    async fn exit_during_handshake() {
        let mut bridge = sh_bridge("cat >/dev/null; exit 4");
        let err = bridge.start().await.unwrap_err();
        match err {
            BridgeError::WorkerExited { status, phase } => {
                assert_eq!(status.code(), Some(4));
                assert_eq!(phase, ExitPhase::Handshake);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let mut bridge = sh_bridge("sleep 30");
        let err = bridge.start().await.unwrap_err();
        assert!(
            matches!(
                err,
                BridgeError::Secure(SecureError::Handshake(HandshakeError::Timeout(_)))
            ),
            "{err:?}"
        );
        assert!(matches!(
            bridge.invoke::<_, Value>("echo", ()).await,
            Err(BridgeError::InvalidState { state: BridgeState::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_port_fails_readiness() {
        let cert = EphemeralCert::generate().unwrap();
        let hello = serde_json::json!({"port": 9, "cert": cert.cert_pem()}).to_string();
        let mut bridge = sh_bridge(&format!("cat >/dev/null; printf '%s\\n' '{hello}'; sleep 30"));
        let err = bridge.start().await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Secure(SecureError::ReadyTimeout(_))),
            "{err:?}"
        );
    }
}
