//! Worker capability flags.
//!
//! `all` maps to a single `--allow-all`. Otherwise every allow entry becomes
//! `--allow-<cap>` and every deny entry `--deny-<cap>`, deny flags always
//! after allow flags so the runtime resolves conflicts in favour of deny.
//! No permissions at all means no flags: the runtime's most restrictive
//! default.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant every capability.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn with_allow(mut self, capability: impl Into<String>) -> Self {
        self.allow.push(capability.into());
        self
    }

    pub fn with_deny(mut self, capability: impl Into<String>) -> Self {
        self.deny.push(capability.into());
        self
    }

    /// Whether the worker may open sockets: `all`, `net`, or a scoped
    /// `net=host:port` grant.
    pub fn allows_network(&self) -> bool {
        self.all
            || self
                .allow
                .iter()
                .any(|cap| cap == "net" || cap.starts_with("net="))
    }

    pub fn to_flags(&self) -> Vec<String> {
        if self.all {
            return vec!["--allow-all".to_string()];
        }

        let allow = self
            .allow
            .iter()
            .filter(|cap| !cap.is_empty())
            .map(|cap| format!("--allow-{cap}"));
        let deny = self
            .deny
            .iter()
            .filter(|cap| !cap.is_empty())
            .map(|cap| format!("--deny-{cap}"));
        allow.chain(deny).collect()
    }
}

/// Flags for an optional permission set.
pub fn launch_flags(permissions: Option<&Permissions>) -> Vec<String> {
    permissions.map(Permissions::to_flags).unwrap_or_default()
}

/// Flags for a worker that serves HTTPS on loopback and therefore needs
/// network access whatever else it was granted.
pub fn launch_flags_with_network(permissions: Option<&Permissions>) -> Vec<String> {
    let mut flags = launch_flags(permissions);
    if !permissions.is_some_and(Permissions::allows_network) {
        flags.insert(0, "--allow-net".to_string());
    }
    flags
}
