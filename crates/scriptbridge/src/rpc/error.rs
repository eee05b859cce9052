use std::io;
use std::time::Duration;

use serde_json::Value;

use super::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcErrorObject,
};

/// Failure of an outgoing call or notification.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer answered with an error Response.
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The read loop ended (EOF or read error) or the writer was closed.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to write frame: {0}")]
    Io(#[source] io::Error),

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode params: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
}

impl RpcError {
    /// JSON-RPC error code, if the peer answered with one.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The peer has no handler for the method. Expected for optional
    /// capabilities such as `close` or `modifyPlan`.
    pub fn is_method_not_found(&self) -> bool {
        self.code() == Some(METHOD_NOT_FOUND)
    }

    /// The stream itself is gone; every other call on it fails too.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed | RpcError::Io(_))
    }

    /// Error codes reserved by JSON-RPC for malformed traffic, as opposed
    /// to handler failures.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.code(),
            Some(PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS)
        )
    }

    /// A handler on the other side failed.
    pub fn is_application(&self) -> bool {
        match self.code() {
            Some(INTERNAL_ERROR) => true,
            Some(_) => !self.is_protocol(),
            None => false,
        }
    }
}

impl From<RpcErrorObject> for RpcError {
    fn from(err: RpcErrorObject) -> Self {
        RpcError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
