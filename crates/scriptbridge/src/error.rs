//! Bridge-level errors and their classification.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use crate::rpc::{RegistrationError, RpcError};
use crate::secure::SecureError;
use crate::state::BridgeState;
use crate::supervisor::SupervisorError;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pipe, socket or process is gone. Fatal to the bridge.
    Transport,
    /// Malformed traffic or an unknown method. Scoped to one call.
    Protocol,
    /// A handler on the other side failed. Scoped to one call.
    Application,
    /// A lifecycle step (health, handshake, shutdown) failed or the bridge
    /// was used in the wrong state. Fatal to that transition.
    Lifecycle,
}

/// When the worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPhase {
    Startup,
    Handshake,
    Running,
}

impl fmt::Display for ExitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitPhase::Startup => "before becoming healthy",
            ExitPhase::Handshake => "during the certificate handshake",
            ExitPhase::Running => "without a shutdown request",
        })
    }
}

fn exit_message(status: &ExitStatus, phase: &ExitPhase) -> String {
    if status.success() {
        format!("worker exited cleanly {phase}")
    } else {
        format!("worker exited with {status} {phase}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Secure(#[from] SecureError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("bridge is {state}; cannot {operation}")]
    InvalidState {
        state: BridgeState,
        operation: &'static str,
    },

    #[error("worker did not answer health within {0:?}")]
    HealthTimeout(Duration),

    #[error("worker reported unhealthy")]
    Unhealthy,

    #[error("health check failed: {0}")]
    HealthCheck(#[source] RpcError),

    #[error("{}", exit_message(.status, .phase))]
    WorkerExited { status: ExitStatus, phase: ExitPhase },

    #[error("worker did not exit within {0:?} of the shutdown request and was killed")]
    ShutdownTimeout(Duration),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Supervisor(_) | BridgeError::WorkerExited { .. } => ErrorKind::Transport,
            BridgeError::Rpc(e) => rpc_kind(e),
            BridgeError::Secure(e) => e.kind(),
            BridgeError::Registration(_)
            | BridgeError::InvalidState { .. }
            | BridgeError::HealthTimeout(_)
            | BridgeError::Unhealthy
            | BridgeError::HealthCheck(_)
            | BridgeError::ShutdownTimeout(_) => ErrorKind::Lifecycle,
        }
    }

    /// Transport and lifecycle failures end the bridge instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Lifecycle)
    }

    /// The worker does not implement the operation. Callers treat this as
    /// "feature absent" for optional operations.
    pub fn is_method_not_found(&self) -> bool {
        match self {
            BridgeError::Rpc(e) => e.is_method_not_found(),
            BridgeError::Secure(e) => e.is_method_not_found(),
            _ => false,
        }
    }

    /// True for a worker exit that was not a failure status.
    pub fn exited_cleanly(&self) -> bool {
        matches!(self, BridgeError::WorkerExited { status, .. } if status.success())
    }
}

pub(crate) fn rpc_kind(e: &RpcError) -> ErrorKind {
    if e.is_transport() {
        ErrorKind::Transport
    } else if e.is_application() {
        ErrorKind::Application
    } else {
        ErrorKind::Protocol
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
