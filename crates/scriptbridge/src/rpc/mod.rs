//! JSON-RPC 2.0 over newline-delimited streams.

pub mod codec;
pub mod engine;
pub mod error;
pub mod handler;
pub mod protocol;

pub use codec::FrameCodec;
pub use engine::{EngineConfig, Peer, RpcEngine};
pub use error::RpcError;
pub use handler::{Handler, HandlerError, HandlerTable, RegistrationError, RequestContext};
pub use protocol::{Id, Message, Notification, Request, Response, RpcErrorObject};
