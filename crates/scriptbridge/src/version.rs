//! Version information for scriptbridge.

/// Version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent by the secure client.
pub fn user_agent() -> String {
    format!("scriptbridge/{BRIDGE_VERSION}")
}
