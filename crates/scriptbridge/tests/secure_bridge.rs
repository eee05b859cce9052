//! End-to-end tests of the secure binding against the `echo-worker` binary.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use scriptbridge::{
    BridgeError, BridgeState, ConfigFile, ExitPhase, Invoker, LaunchSpec, OptionalExt,
    RuntimeCommand, SecureBridge, SecureConfig,
};

fn bridge(client_auth: &str) -> SecureBridge {
    let spec = LaunchSpec::new("echo-worker")
        .with_config(ConfigFile::Disabled)
        .with_runtime(
            RuntimeCommand::new(env!("CARGO_BIN_EXE_echo-worker")).with_args(Vec::<String>::new()),
        )
        .with_env("ECHO_WORKER_MODE", "secure")
        .with_env("ECHO_WORKER_CLIENT_AUTH", client_auth);
    SecureBridge::new(spec).with_config(
        SecureConfig::new()
            .with_handshake_timeout(Duration::from_secs(10))
            .with_health_timeout(Duration::from_secs(10)),
    )
}

#[tokio::test]
async fn invoke_over_mutual_tls() {
    let mut bridge = bridge("both");
    bridge.start().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Healthy);
    assert!(bridge.pid().is_some());

    let reply: Value = bridge.invoke("echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(reply["echoed"], "hi");

    let invoker: &dyn Invoker = &bridge;
    let reply = invoker.invoke("/echo", json!({"message": [1, 2]})).await.unwrap();
    assert_eq!(reply["echoed"], json!([1, 2]));
    assert_eq!(invoker.invoke("close", json!({})).await.optional().unwrap(), None);

    bridge.stop().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(matches!(
        bridge.invoke::<_, Value>("echo", json!({})).await,
        Err(BridgeError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn ndjson_progress_stream() {
    let mut bridge = bridge("header");
    bridge.start().await.unwrap();

    let values: Vec<Value> = bridge
        .invoke_stream("progress", json!({"steps": 3}))
        .await
        .unwrap()
        .map(|v| v.unwrap())
        .collect()
        .await;
    assert_eq!(
        values,
        vec![
            json!({"msg": "step 1/3"}),
            json!({"msg": "step 2/3"}),
            json!({"msg": "step 3/3"}),
            json!({"done": 3}),
        ]
    );

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn tls_only_client_auth() {
    let mut bridge = bridge("tls");
    bridge.start().await.unwrap();
    let client = bridge.client().unwrap();
    assert!(client.health().await.unwrap());
    bridge.notify("echo", json!({"message": "fire and forget"})).await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn unexpected_exit_moves_bridge_to_failed() {
    let mut bridge = bridge("both");
    bridge.start().await.unwrap();
    let mut states = bridge.subscribe();

    bridge.notify("exit", json!({"code": 7})).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == BridgeState::Failed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        bridge.invoke::<_, Value>("echo", json!({})).await,
        Err(BridgeError::InvalidState { state: BridgeState::Failed, .. })
    ));
    match bridge.stop().await.unwrap_err() {
        BridgeError::WorkerExited { status, phase } => {
            assert_eq!(status.code(), Some(7));
            assert_eq!(phase, ExitPhase::Running);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(bridge.state(), BridgeState::Failed);
}

#[cfg(unix)]
#[tokio::test]
async fn killed_worker_is_reported_on_stop() {
    let mut bridge = bridge("tls");
    bridge.start().await.unwrap();
    let mut states = bridge.subscribe();

    let pid = bridge.pid().unwrap().to_string();
    let killed = tokio::process::Command::new("kill")
        .args(["-9", &pid])
        .status()
        .await
        .unwrap();
    assert!(killed.success());

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == BridgeState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(
        bridge.stop().await,
        Err(BridgeError::WorkerExited { phase: ExitPhase::Running, .. })
    ));
}
