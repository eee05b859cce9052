//! Demo worker speaking either binding.
//!
//! `ECHO_WORKER_MODE` selects the behaviour: `stdio` (default), `secure`,
//! `unhealthy`, `silent`, `crash`, `clean-exit`.

use std::convert::Infallible;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use scriptbridge::logging::init_tracing;
use scriptbridge::rpc::{HandlerError, HandlerTable, RequestContext};
use scriptbridge::secure::{ClientAuth, serve_secure};
use scriptbridge::worker::StdioWorker;

const MODE_ENV: &str = "ECHO_WORKER_MODE";
const CLIENT_AUTH_ENV: &str = "ECHO_WORKER_CLIENT_AUTH";

#[derive(Debug, Deserialize)]
struct EchoParams {
    #[serde(default)]
    message: Value,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
    #[serde(default)]
    tag: Value,
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default = "default_failure")]
    message: String,
}

fn default_failure() -> String {
    "requested failure".to_string()
}

#[derive(Debug, Deserialize)]
struct ProgressParams {
    steps: u32,
}

#[derive(Debug, Deserialize)]
struct ExitParams {
    #[serde(default)]
    code: i32,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn echo_reply(message: Value) -> Value {
    json!({ "echoed": message, "timestamp": now_millis() })
}

fn stdio_handlers(healthy: bool) -> Result<HandlerTable, anyhow::Error> {
    let mut handlers = HandlerTable::new();

    if !healthy {
        handlers.register_request("health", |_cx, _p: Value| async {
            Ok::<_, HandlerError>(json!({ "ok": false }))
        })?;
    }

    handlers.register_request("echo", |_cx, p: EchoParams| async move {
        Ok::<_, HandlerError>(echo_reply(p.message))
    })?;

    handlers.register_request("sleep", |_cx, p: SleepParams| async move {
        tokio::time::sleep(Duration::from_millis(p.ms)).await;
        Ok::<_, HandlerError>(json!({ "tag": p.tag }))
    })?;

    handlers.register_request("fail", |_cx, p: FailParams| async move {
        Err::<Value, _>(HandlerError::new(p.message))
    })?;

    handlers.register_request("progress", |cx: RequestContext, p: ProgressParams| async move {
        for step in 1..=p.steps {
            cx.peer()
                .notify("invokeProgress", json!({ "msg": format!("step {step}/{}", p.steps) }))
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
        }
        Ok::<_, HandlerError>(json!({ "done": p.steps }))
    })?;

    handlers.register_request("config", |cx: RequestContext, _p: Value| async move {
        let config: Value = cx
            .peer()
            .call("getConfig", ())
            .await
            .map_err(|e| HandlerError::new(format!("getConfig failed: {e}")))?;
        Ok::<_, HandlerError>(config)
    })?;

    handlers.register_notification("exit", |_cx, p: ExitParams| async move {
        tracing::info!(code = p.code, "Exit requested");
        std::process::exit(p.code);
    })?;

    Ok(handlers)
}

async fn echo_route(Json(p): Json<EchoParams>) -> Json<Value> {
    Json(echo_reply(p.message))
}

async fn progress_route(Json(p): Json<ProgressParams>) -> Response {
    let steps = p.steps;
    let lines = (1..=steps)
        .map(move |step| json!({ "msg": format!("step {step}/{steps}") }))
        .chain(std::iter::once(json!({ "done": steps })))
        .map(|value| Ok::<_, Infallible>(format!("{value}\n")));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(futures::stream::iter(lines)),
    )
        .into_response()
}

/// Exits shortly after answering, so the reply still reaches the host.
async fn exit_route(Json(p): Json<ExitParams>) -> StatusCode {
    tracing::info!(code = p.code, "Exit requested");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(p.code);
    });
    StatusCode::ACCEPTED
}

fn secure_app() -> Router {
    Router::new()
        .route("/echo", post(echo_route))
        .route("/progress", post(progress_route))
        .route("/exit", post(exit_route))
}

async fn run_secure() -> anyhow::Result<()> {
    let auth = match std::env::var(CLIENT_AUTH_ENV) {
        Ok(value) => ClientAuth::parse(&value)
            .with_context(|| format!("invalid {CLIENT_AUTH_ENV}: {value:?}"))?,
        Err(_) => ClientAuth::default(),
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    serve_secure(secure_app(), auth, shutdown)
        .await
        .context("secure worker failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mode = std::env::var(MODE_ENV).unwrap_or_else(|_| "stdio".to_string());
    tracing::debug!(%mode, "echo-worker starting");

    match mode.as_str() {
        "stdio" | "unhealthy" => {
            let handlers = stdio_handlers(mode == "stdio")?;
            StdioWorker::new(handlers)?.run_stdio().await?;
        }
        "secure" => run_secure().await?,
        "silent" => {
            // Keep stdin open and never answer.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        "crash" => {
            tracing::error!("Crashing on request");
            std::process::exit(3);
        }
        "clean-exit" => std::process::exit(0),
        other => anyhow::bail!("unknown {MODE_ENV}: {other:?}"),
    }

    Ok(())
}
