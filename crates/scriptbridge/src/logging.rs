//! Tracing setup for binaries built on the crate.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "SCRIPTBRIDGE_LOG";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(level: &str) -> String {
    format!("scriptbridge={level},echo_worker={level}")
}

/// Initialize tracing with `RUST_LOG`, else `SCRIPTBRIDGE_LOG`, and
/// `LOG_FORMAT=json` support.
///
/// Always writes to stderr: stdout carries the protocol. Calling it twice
/// is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(default_filter(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
