//! One calling interface over both bindings.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BridgeError;
use crate::lifecycle::Bridge;
use crate::secure::SecureBridge;

/// Invoke operations on a started worker without caring how it is reached.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Call `operation` and wait for its result.
    async fn invoke(&self, operation: &str, params: Value) -> Result<Value, BridgeError>;

    /// Fire `operation` without a result.
    async fn notify(&self, operation: &str, params: Value) -> Result<(), BridgeError>;
}

#[async_trait]
impl Invoker for Bridge {
    async fn invoke(&self, operation: &str, params: Value) -> Result<Value, BridgeError> {
        self.call(operation, params).await
    }

    async fn notify(&self, operation: &str, params: Value) -> Result<(), BridgeError> {
        Bridge::notify(self, operation, params).await
    }
}

#[async_trait]
impl Invoker for SecureBridge {
    async fn invoke(&self, operation: &str, params: Value) -> Result<Value, BridgeError> {
        SecureBridge::invoke(self, operation, params).await
    }

    async fn notify(&self, operation: &str, params: Value) -> Result<(), BridgeError> {
        SecureBridge::notify(self, operation, params).await
    }
}

/// Treat "the worker does not implement this" as absence.
///
/// ```ignore
/// let closed = bridge.invoke("close", json!({})).await.optional()?;
/// ```
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, BridgeError>;
}

impl<T> OptionalExt<T> for Result<T, BridgeError> {
    fn optional(self) -> Result<Option<T>, BridgeError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_method_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
