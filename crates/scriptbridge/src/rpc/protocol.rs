//! JSON-RPC 2.0 message types.
//!
//! Every frame on the stdio binding is one of three shapes:
//! - Request: `{"jsonrpc":"2.0","id":..,"method":..,"params":..}` expects exactly one Response
//! - Notification: `{"jsonrpc":"2.0","method":..,"params":..}` never answered
//! - Response: `{"jsonrpc":"2.0","id":..,"result":..}` or `{..,"error":{code,message,data}}`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist on the receiving side.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler failure on the receiving side.
pub const INTERNAL_ERROR: i64 = -32603;

/// The `"jsonrpc": "2.0"` marker. Accepts a missing or differing value on
/// input so lenient peers are still understood; always writes "2.0".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version != JSONRPC_VERSION {
            tracing::debug!(%version, "Peer sent unexpected jsonrpc version");
        }
        Ok(Version)
    }
}

/// Request identifier.
///
/// Our outgoing ids are always `i64`; inbound ids are echoed back in
/// whatever form the peer chose. Fractional ids and integers outside the
/// `i64` range land in `OtherNumber`, kept exactly as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    OtherNumber(serde_json::Number),
    String(String),
    Null,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::OtherNumber(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s:?}"),
            Id::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Version,
    pub id: Id,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<Id>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

/// Error object carried by an error Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(Value::String(detail.to_string()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Success or failure half of a Response. Flattened so it serializes as a
/// sibling `result` or `error` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: Version,
    pub id: Id,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: Id, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

/// A classified JSON-RPC frame. Decoding goes through [`Message::classify`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why a JSON value could not be classified as a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has neither a method nor a result/error member")]
    Unrecognized,
    #[error("malformed {kind}: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// Order matters: `method` + `id` is a Request, `method` alone is a
    /// Notification, anything else must look like a Response.
    pub fn classify(value: Value) -> Result<Self, ClassifyError> {
        let Value::Object(ref object) = value else {
            return Err(ClassifyError::NotAnObject);
        };

        let has_method = object.contains_key("method");
        let has_id = object.contains_key("id");
        let has_result = object.contains_key("result");
        let has_error = object.contains_key("error");

        if has_method && has_id {
            serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|source| ClassifyError::Malformed {
                    kind: "request",
                    source,
                })
        } else if has_method {
            serde_json::from_value(value)
                .map(Message::Notification)
                .map_err(|source| ClassifyError::Malformed {
                    kind: "notification",
                    source,
                })
        } else if has_id && (has_result ^ has_error) {
            serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|source| ClassifyError::Malformed {
                    kind: "response",
                    source,
                })
        } else {
            Err(ClassifyError::Unrecognized)
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes() {
        let req = Request::new(7, "echo", Some(json!({"message": "hi"})));
        insta::assert_json_snapshot!(req, @r#"
        {
          "jsonrpc": "2.0",
          "id": 7,
          "method": "echo",
          "params": {
            "message": "hi"
          }
        }
        "#);
    }

    #[test]
    fn notification_without_params_omits_member() {
        let n = Notification::new("shutdown", None);
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"jsonrpc": "2.0", "method": "shutdown"})
        );
    }

    #[test]
    fn error_response_serializes() {
        let resp = Response::error(Id::Number(3), RpcErrorObject::method_not_found("close"));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "jsonrpc": "2.0",
          "id": 3,
          "error": {
            "code": -32601,
            "message": "method not found: close"
          }
        }
        "#);
    }

    #[test]
    fn null_result_is_a_success() {
        let msg = Message::classify(json!({"jsonrpc": "2.0", "id": 1, "result": null})).unwrap();
        assert_eq!(msg, Message::Response(Response::success(Id::Number(1), Value::Null)));
    }

    #[test]
    fn classify_request_notification_response() {
        let req = Message::classify(json!({"jsonrpc": "2.0", "id": "a", "method": "m"})).unwrap();
        assert!(matches!(req, Message::Request(Request { id: Id::String(ref s), .. }) if s == "a"));

        let note = Message::classify(json!({"jsonrpc": "2.0", "method": "progress"})).unwrap();
        assert!(matches!(note, Message::Notification(_)));

        let resp = Message::classify(
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32603, "message": "boom"}}),
        )
        .unwrap();
        match resp {
            Message::Response(Response {
                id: Id::Number(2),
                outcome: Outcome::Error(err),
                ..
            }) => {
                assert_eq!(err.code, INTERNAL_ERROR);
                assert_eq!(err.message, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_unrecognized_shapes() {
        assert!(matches!(
            Message::classify(json!([1, 2])),
            Err(ClassifyError::NotAnObject)
        ));
        assert!(matches!(
            Message::classify(json!({"jsonrpc": "2.0", "id": 1})),
            Err(ClassifyError::Unrecognized)
        ));
        assert!(matches!(
            Message::classify(json!({"id": 1, "result": 1, "error": {"code": 1, "message": ""}})),
            Err(ClassifyError::Unrecognized)
        ));
        assert!(matches!(
            Message::classify(json!({"id": 1, "method": 5})),
            Err(ClassifyError::Malformed { kind: "request", .. })
        ));
    }

    #[test]
    fn missing_jsonrpc_member_is_tolerated() {
        let msg = Message::classify(json!({"method": "health", "id": 1})).unwrap();
        assert_eq!(msg.method(), Some("health"));
    }
}
