//! scriptbridge: supervised script workers driven over JSON-RPC.
//!
//! Two bindings share one lifecycle model:
//!
//! - **stdio** ([`Bridge`]): newline-delimited JSON-RPC 2.0 on the worker's
//!   stdin/stdout, calls in both directions.
//! - **secure** ([`SecureBridge`]): ephemeral certificates swapped over
//!   stdin/stdout, then HTTPS on a loopback port with client authentication.
//!
//! Both implement [`Invoker`].

pub mod config_lookup;
pub mod error;
pub mod invoke;
pub mod lifecycle;
pub mod logging;
pub mod permissions;
pub mod rpc;
pub mod secure;
pub mod state;
pub mod supervisor;
pub mod version;
pub mod worker;

pub use config_lookup::ConfigLocator;
pub use error::{BridgeError, ErrorKind, ExitPhase};
pub use invoke::{Invoker, OptionalExt};
pub use lifecycle::{Bridge, BridgeConfig, ExitReport};
pub use permissions::Permissions;
pub use rpc::{EngineConfig, HandlerError, HandlerTable, Peer, RequestContext, RpcEngine, RpcError};
pub use secure::{
    ClientAuth, SecureBridge, SecureClient, SecureConfig, SecureError, SecureServer, serve_secure,
};
pub use state::{BridgeState, HealthReport};
pub use supervisor::{ConfigFile, LaunchSpec, ProcessSupervisor, RuntimeCommand, ScriptRef};
pub use version::BRIDGE_VERSION;
pub use worker::StdioWorker;
