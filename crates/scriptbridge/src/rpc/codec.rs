//! Newline-delimited JSON-RPC framing.
//!
//! Wraps [`LinesCodec`] and classifies each line as a [`Message`].
//! Works over any AsyncRead/AsyncWrite (child pipes, duplex streams, sockets).
//!
//! Bad input never ends the stream: unparsable JSON becomes a synthetic
//! parse-error Response with a null id, unclassifiable objects are logged and
//! skipped, and overlong lines are discarded up to the next newline. Only an
//! I/O error from the underlying reader terminates decoding.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{Id, Message, Response, RpcErrorObject};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec that frames messages as one JSON object per line.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LinesCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn next_message(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Message>, io::Error> {
        loop {
            let line = if eof {
                self.inner.decode_eof(src)
            } else {
                self.inner.decode(src)
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("Discarding frame over the maximum line length");
                    continue;
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            };

            if let Some(message) = decode_line(&line) {
                return Ok(Some(message));
            }
        }
    }
}

/// Decode a single line. `None` means the line carried nothing to act on
/// (blank, or an unclassifiable object that has already been logged).
pub fn decode_line(line: &str) -> Option<Message> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Unparsable frame");
            return Some(Message::Response(Response::error(
                Id::Null,
                RpcErrorObject::parse_error(e),
            )));
        }
    };

    match Message::classify(value) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unclassifiable frame");
            None
        }
    }
}

/// Encode a message as a single line, newline included.
pub fn encode_line(message: &Message) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, true)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum line length")
            }
        })
    }
}
