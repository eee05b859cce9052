//! Host side HTTPS client pinned to one worker certificate.

use std::io;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Certificate, Identity, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use url::Url;

use super::cert::EphemeralCert;
use super::{CLIENT_CERT_HASH_HEADER, HEALTH_PATH, SecureConfig, SecureError};
use crate::rpc::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::version::user_agent;

/// Talks to one worker. Trusts only the certificate from its handshake and
/// presents the host's ephemeral identity.
#[derive(Debug, Clone)]
pub struct SecureClient {
    http: reqwest::Client,
    base: Url,
}

impl SecureClient {
    pub fn new(
        port: u16,
        server_cert_pem: &str,
        identity: &EphemeralCert,
        config: &SecureConfig,
    ) -> Result<Self, SecureError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CLIENT_CERT_HASH_HEADER,
            HeaderValue::from_str(&identity.fingerprint())?,
        );

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(Certificate::from_pem(server_cert_pem.as_bytes())?)
            .identity(Identity::from_pem(&identity.identity_pem())?)
            .https_only(true)
            .timeout(config.request_timeout)
            .user_agent(user_agent())
            .default_headers(headers)
            .build()?;

        let base = Url::parse(&format!("https://127.0.0.1:{port}/"))
            .map_err(|e| SecureError::InvalidOperation(e.to_string()))?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, operation: &str) -> Result<Url, SecureError> {
        let path = operation.trim_start_matches('/');
        if path.is_empty() || path.contains("://") {
            return Err(SecureError::InvalidOperation(operation.to_string()));
        }
        self.base
            .join(path)
            .map_err(|_| SecureError::InvalidOperation(operation.to_string()))
    }

    /// One readiness probe. Connection errors are returned, not retried.
    pub async fn health(&self) -> Result<bool, SecureError> {
        let response = self.http.get(self.url(HEALTH_PATH)?).send().await?;
        Ok(matches!(response.status(), StatusCode::OK | StatusCode::NO_CONTENT))
    }

    /// Poll `/health` every `interval` until it answers 200/204.
    pub async fn wait_ready(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), SecureError> {
        let poll = async {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match self.health().await {
                    Ok(true) => {
                        tracing::debug!(attempts, "Worker ready");
                        return;
                    }
                    Ok(false) => tracing::trace!(attempts, "Worker not ready yet"),
                    Err(e) => tracing::trace!(attempts, error = %e, "Health probe failed"),
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SecureError::ReadyTimeout(timeout))
    }

    async fn post<P: Serialize>(
        &self,
        operation: &str,
        params: &P,
    ) -> Result<reqwest::Response, SecureError> {
        let url = self.url(operation)?;
        tracing::debug!(operation, "Invoking worker");
        let response = self.http.post(url).json(params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SecureError::Status { status, body })
    }

    /// `POST /<operation>` with a JSON body; the JSON reply decoded as `R`.
    /// An empty body decodes as `null`.
    pub async fn invoke<P, R>(&self, operation: &str, params: P) -> Result<R, SecureError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let bytes = self.post(operation, &params).await?.bytes().await?;
        let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &bytes
        };
        serde_json::from_slice(body).map_err(SecureError::Decode)
    }

    /// `POST /<operation>` whose reply is NDJSON; yields one value per line.
    pub async fn invoke_stream<P: Serialize>(
        &self,
        operation: &str,
        params: P,
    ) -> Result<BoxStream<'static, Result<Value, SecureError>>, SecureError> {
        let response = self.post(operation, &params).await?;
        let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let codec = LinesCodec::new_with_max_length(DEFAULT_MAX_FRAME_LENGTH);
        let lines = FramedRead::new(reader, codec);

        Ok(lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => Some(serde_json::from_str(&line).map_err(SecureError::Decode)),
                    Err(LinesCodecError::Io(e)) => Some(Err(SecureError::Io(e))),
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        Some(Err(SecureError::Io(io::Error::other("stream line too long"))))
                    }
                }
            })
            .boxed())
    }

    /// Post and discard the reply body.
    pub async fn notify<P: Serialize>(
        &self,
        operation: &str,
        params: P,
    ) -> Result<(), SecureError> {
        self.post(operation, &params).await?;
        Ok(())
    }
}
