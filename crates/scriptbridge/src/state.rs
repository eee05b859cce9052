//! Bridge lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one bridge instance.
///
/// `Unstarted -> Starting -> Healthy -> ShuttingDown -> Stopped`, with
/// `Failed` reachable from `Starting` or `Healthy`. `Stopped` and `Failed`
/// are terminal: build a new bridge rather than restarting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    /// Constructed, no process yet
    #[default]
    Unstarted,
    /// Process spawned, waiting for health
    Starting,
    /// Answered health, accepting calls
    Healthy,
    /// Shutdown requested, waiting for exit
    ShuttingDown,
    Stopped,
    /// Startup failed or the worker died unexpectedly
    Failed,
}

impl BridgeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Stopped | BridgeState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, next),
            (Unstarted, Starting)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Healthy, ShuttingDown)
                | (Healthy, Failed)
                | (ShuttingDown, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Unstarted => "unstarted",
            BridgeState::Starting => "starting",
            BridgeState::Healthy => "healthy",
            BridgeState::ShuttingDown => "shutting down",
            BridgeState::Stopped => "stopped",
            BridgeState::Failed => "failed",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to the reserved `health` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
}

impl HealthReport {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unstarted() {
        assert_eq!(BridgeState::default(), BridgeState::Unstarted);
    }

    #[test]
    fn serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                BridgeState::Unstarted,
                BridgeState::Starting,
                BridgeState::Healthy,
                BridgeState::ShuttingDown,
                BridgeState::Stopped,
                BridgeState::Failed,
            ],
            @r#"
        [
          "UNSTARTED",
          "STARTING",
          "HEALTHY",
          "SHUTTING_DOWN",
          "STOPPED",
          "FAILED"
        ]
        "#
        );
    }

    #[test]
    fn transitions() {
        use BridgeState::*;
        assert!(Unstarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Failed));
        assert!(Healthy.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Unstarted.can_transition_to(Healthy));
        assert!(!ShuttingDown.can_transition_to(Failed));
        assert!(Failed.is_terminal() && Stopped.is_terminal());
        assert!(!Healthy.is_terminal());
    }

    #[test]
    fn health_report_shape() {
        assert_eq!(
            serde_json::to_value(HealthReport::ok()).unwrap(),
            serde_json::json!({"ok": true})
        );
        let report: HealthReport = serde_json::from_str(r#"{"ok":false}"#).unwrap();
        assert!(!report.ok);
    }
}
