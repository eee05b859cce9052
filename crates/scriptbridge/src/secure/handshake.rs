//! Certificate exchange over the worker's stdin/stdout.
//!
//! ```text
//! host -> worker stdin:   {"cert":"<client PEM>"}\n   then EOF
//! worker -> host stdout:  {"port":<u16>,"cert":"<server PEM>"}\n
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest handshake line accepted. A PEM certificate is ~1 KiB.
const MAX_HELLO_LEN: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to write handshake: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read handshake: {0}")]
    Read(#[source] std::io::Error),
    #[error("EOF before handshake received")]
    Eof,
    #[error("timeout waiting for handshake after {0:?}")]
    Timeout(Duration),
    #[error("failed to parse handshake JSON {line:?}: {source}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("handshake missing port field")]
    MissingPort,
    #[error("handshake missing cert field")]
    MissingCert,
}

/// First message, host to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    #[serde(default)]
    pub cert: String,
}

/// Reply, worker to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub cert: String,
}

impl ServerHello {
    fn validate(self) -> Result<Self, HandshakeError> {
        if self.port == 0 {
            return Err(HandshakeError::MissingPort);
        }
        if self.cert.trim().is_empty() {
            return Err(HandshakeError::MissingCert);
        }
        Ok(self)
    }
}

fn parse<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, HandshakeError> {
    serde_json::from_str(line.trim()).map_err(|source| HandshakeError::Parse {
        line: line.trim().chars().take(128).collect(),
        source,
    })
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message).map_err(|e| HandshakeError::Write(e.into()))?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(HandshakeError::Write)?;
    writer.flush().await.map_err(HandshakeError::Write)
}

/// Send the client certificate and close the stream so the worker sees EOF.
pub async fn write_client_hello<W>(mut writer: W, cert_pem: &str) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    write_line(
        &mut writer,
        &ClientHello {
            cert: cert_pem.to_string(),
        },
    )
    .await?;
    writer.shutdown().await.map_err(HandshakeError::Write)
}

/// Read exactly one line. Anything after it stays buffered in `reader`.
pub async fn read_server_hello<R>(reader: &mut R) -> Result<ServerHello, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .take(MAX_HELLO_LEN)
        .read_line(&mut line)
        .await
        .map_err(HandshakeError::Read)?;
    if n == 0 {
        return Err(HandshakeError::Eof);
    }
    parse::<ServerHello>(&line)?.validate()
}

/// [`read_server_hello`] bounded by `timeout`.
pub async fn read_server_hello_timeout<R>(
    reader: &mut R,
    timeout: Duration,
) -> Result<ServerHello, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(timeout, read_server_hello(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

/// Worker side: read stdin to EOF and extract the client certificate.
pub async fn read_client_hello<R>(reader: R) -> Result<ClientHello, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    reader
        .take(MAX_HELLO_LEN)
        .read_to_string(&mut buf)
        .await
        .map_err(HandshakeError::Read)?;
    if buf.trim().is_empty() {
        return Err(HandshakeError::Eof);
    }
    let hello: ClientHello = parse(&buf)?;
    if hello.cert.trim().is_empty() {
        return Err(HandshakeError::MissingCert);
    }
    Ok(hello)
}

pub async fn write_server_hello<W>(
    writer: &mut W,
    hello: &ServerHello,
) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, hello).await
}
