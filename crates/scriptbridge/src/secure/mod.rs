//! Mutually-authenticated HTTPS binding.
//!
//! Both sides mint an [`EphemeralCert`], swap them over the worker's
//! stdin/stdout ([`handshake`]), then talk HTTPS on a loopback port. The
//! host trusts only the worker's certificate; the worker trusts only the
//! host's, checked at the TLS layer, by the `X-Client-Cert-Hash` header, or
//! both ([`ClientAuth`]).

mod bridge;
pub mod cert;
mod client;
pub mod handshake;
mod server;

use std::io;
use std::time::Duration;

use reqwest::StatusCode;

use crate::error::ErrorKind;
use crate::lifecycle::{HEALTH_TIMEOUT_ENV, env_duration};

pub use bridge::SecureBridge;
pub use cert::EphemeralCert;
pub use client::SecureClient;
pub use handshake::{ClientHello, HandshakeError, ServerHello};
pub use server::{SecureServer, TlsListener, serve_secure};

/// Carries the hex SHA-256 of the client certificate PEM.
pub const CLIENT_CERT_HASH_HEADER: &str = "x-client-cert-hash";

/// Readiness endpoint polled by the host.
pub const HEALTH_PATH: &str = "/health";

pub const HANDSHAKE_TIMEOUT_ENV: &str = "SCRIPTBRIDGE_HANDSHAKE_TIMEOUT_SECS";

#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    #[error("failed to generate certificate: {0}")]
    CertGen(#[from] rcgen::Error),
    #[error("invalid PEM: {0}")]
    InvalidPem(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("worker answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid operation name {0:?}")]
    InvalidOperation(String),
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("worker not ready within {0:?}")]
    ReadyTimeout(Duration),
}

impl SecureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecureError::Http(_) | SecureError::Bind(_) | SecureError::Io(_) => {
                ErrorKind::Transport
            }
            SecureError::Status { status, .. } if status.is_server_error() => {
                ErrorKind::Application
            }
            SecureError::Status { .. }
            | SecureError::Decode(_)
            | SecureError::InvalidOperation(_) => ErrorKind::Protocol,
            SecureError::CertGen(_)
            | SecureError::InvalidPem(_)
            | SecureError::Handshake(_)
            | SecureError::Tls(_)
            | SecureError::Verifier(_)
            | SecureError::InvalidHeader(_)
            | SecureError::ReadyTimeout(_) => ErrorKind::Lifecycle,
        }
    }

    /// 404: the worker has no route for the operation.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, SecureError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// How the worker checks the host's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// TLS client certificate, verified against the handshake certificate.
    Tls,
    /// `X-Client-Cert-Hash` header only.
    Header,
    #[default]
    Both,
}

impl ClientAuth {
    pub(crate) fn verifies_tls(self) -> bool {
        matches!(self, ClientAuth::Tls | ClientAuth::Both)
    }

    pub(crate) fn verifies_header(self) -> bool {
        matches!(self, ClientAuth::Header | ClientAuth::Both)
    }

    /// `tls`, `header` or `both`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" => Some(ClientAuth::Tls),
            "header" => Some(ClientAuth::Header),
            "both" => Some(ClientAuth::Both),
            _ => None,
        }
    }
}

/// Host-side timeouts for the secure binding.
#[derive(Debug, Clone)]
pub struct SecureConfig {
    pub handshake_timeout: Duration,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
    /// Per-request timeout on the HTTPS client.
    pub request_timeout: Duration,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SecureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SCRIPTBRIDGE_HANDSHAKE_TIMEOUT_SECS` and
    /// `SCRIPTBRIDGE_HEALTH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_duration(HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = timeout;
        }
        if let Some(timeout) = env_duration(HEALTH_TIMEOUT_ENV) {
            config.health_timeout = timeout;
        }
        config
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
