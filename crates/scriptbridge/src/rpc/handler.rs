//! Local method table.
//!
//! Handlers come in two tagged flavours keyed by method name: request
//! handlers produce a result that is written back as a Response, notification
//! handlers produce nothing. The table is filled before the engine is built
//! and is read-only afterwards.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::engine::Peer;
use super::protocol::{INTERNAL_ERROR, INVALID_PARAMS, Id, RpcErrorObject};

type RequestFuture = BoxFuture<'static, Result<Value, HandlerError>>;
type RequestFn = Arc<dyn Fn(RequestContext, Option<Value>) -> RequestFuture + Send + Sync>;
type NotificationFn =
    Arc<dyn Fn(RequestContext, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Error returned by a request handler. Becomes an error Response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl HandlerError {
    /// Application failure, reported as an internal error (-32603).
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(INTERNAL_ERROR, message)
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::with_code(INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn code(&self) -> i64 {
        self.code
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<HandlerError> for RpcErrorObject {
    fn from(err: HandlerError) -> Self {
        RpcErrorObject {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Rejected handler registration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("method name must not be empty")]
    EmptyName,
    #[error("method names starting with 'rpc.' are reserved: {0}")]
    Reserved(String),
    #[error("a handler is already registered for method: {0}")]
    Duplicate(String),
}

/// What a handler sees besides its params.
#[derive(Clone)]
pub struct RequestContext {
    method: String,
    id: Option<Id>,
    peer: Peer,
}

impl RequestContext {
    pub(crate) fn new(method: String, id: Option<Id>, peer: Peer) -> Self {
        Self { method, id, peer }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Id of the inbound request; `None` for notifications.
    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Handle to the other side, for progress notifications or callbacks.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub enum Handler {
    Request(RequestFn),
    Notification(NotificationFn),
}

impl Handler {
    /// Run the handler as if it answered a request. Notification handlers
    /// answer `null`.
    pub(crate) fn call(
        &self,
        cx: RequestContext,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, RpcErrorObject>> {
        match self {
            Handler::Request(f) => f(cx, params).map(|r| r.map_err(RpcErrorObject::from)).boxed(),
            Handler::Notification(f) => f(cx, params).map(|()| Ok(Value::Null)).boxed(),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Request(_) => f.write_str("Handler::Request"),
            Handler::Notification(_) => f.write_str("Handler::Notification"),
        }
    }
}

fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, HandlerError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(HandlerError::invalid_params)
}

/// Method name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler with typed params and result.
    ///
    /// Params that fail to deserialize into `P` are answered with -32602
    /// without invoking the handler. Use `serde_json::Value` for `P` to
    /// accept anything, `()` for no params.
    pub fn register_request<P, R, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let f: RequestFn = Arc::new(move |cx: RequestContext, params: Option<Value>| {
            match decode_params::<P>(params) {
                Ok(params) => {
                    let fut = handler(cx, params);
                    async move {
                        let result = fut.await?;
                        Ok::<_, HandlerError>(serde_json::to_value(result)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        });
        self.insert(method.into(), Handler::Request(f))
    }

    /// Register a notification handler. Params that fail to deserialize are
    /// logged and the notification is dropped.
    pub fn register_notification<P, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f: NotificationFn = Arc::new(move |cx: RequestContext, params: Option<Value>| {
            match decode_params::<P>(params) {
                Ok(params) => handler(cx, params).boxed(),
                Err(e) => {
                    tracing::warn!(
                        method = cx.method(),
                        error = %e,
                        "Dropping notification with invalid params"
                    );
                    futures::future::ready(()).boxed()
                }
            }
        });
        self.insert(method.into(), Handler::Notification(f))
    }

    /// Register an already-built handler.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistrationError> {
        self.insert(method.into(), handler)
    }

    fn insert(&mut self, method: String, handler: Handler) -> Result<(), RegistrationError> {
        if method.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if method.starts_with("rpc.") {
            return Err(RegistrationError::Reserved(method));
        }
        match self.handlers.entry(method) {
            Entry::Occupied(e) => Err(RegistrationError::Duplicate(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods().collect();
        methods.sort_unstable();
        f.debug_struct("HandlerTable").field("methods", &methods).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registration_is_validated() {
        let mut table = HandlerTable::new();
        table
            .register_request("echo", |_cx, p: Value| async move { Ok::<_, HandlerError>(p) })
            .unwrap();

        assert_eq!(
            table.register_request("echo", |_cx, p: Value| async move { Ok::<_, HandlerError>(p) }),
            Err(RegistrationError::Duplicate("echo".into()))
        );
        assert_eq!(
            table.register_notification("", |_cx, _p: Value| async {}),
            Err(RegistrationError::EmptyName)
        );
        assert_eq!(
            table.register_notification("rpc.discover", |_cx, _p: Value| async {}),
            Err(RegistrationError::Reserved("rpc.discover".into()))
        );
        assert!(table.contains("echo"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn handler_error_maps_to_error_object() {
        let err = HandlerError::new("disk full").with_data(json!({"free": 0}));
        let obj = RpcErrorObject::from(err);
        assert_eq!(obj.code, INTERNAL_ERROR);
        assert_eq!(obj.message, "disk full");
        assert_eq!(obj.data, Some(json!({"free": 0})));
    }

    #[test]
    fn anyhow_context_is_kept_in_message() {
        let err = anyhow::anyhow!("connection refused").context("fetching config");
        let handler_err = HandlerError::from(err);
        assert_eq!(handler_err.to_string(), "fetching config: connection refused");
        assert_eq!(handler_err.code(), INTERNAL_ERROR);
    }

    #[test]
    fn params_decoding() {
        #[derive(Debug, serde::Deserialize)]
        struct Echo {
            message: String,
        }
        let ok: Echo = decode_params(Some(json!({"message": "hi"}))).unwrap();
        assert_eq!(ok.message, "hi");

        decode_params::<()>(None).unwrap();

        let err = decode_params::<Echo>(Some(json!({"msg": 1}))).unwrap_err();
        assert_eq!(err.code(), INVALID_PARAMS);
    }
}
