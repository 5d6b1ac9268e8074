//! Maps incoming `RegisterAgent` calls to a stable [`AgentId`], detecting
//! reconnects by `(Hostname, OS)`.

use crate::registry::Agent;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Scans `agents` for an existing entry whose descriptor matches
/// `(hostname, os)`. Returns the existing agent id on a hit.
///
/// Weak by construction: spoofable, but this is the core's
/// only notion of identity.
pub fn find_reconnect(
    agents: &DashMap<String, Arc<Agent>>,
    hostname: &str,
    os: &str,
) -> Option<String> {
    for entry in agents.iter() {
        let info = entry.value().info.read();
        if info.hostname == hostname && info.os == os {
            return Some(entry.key().clone());
        }
    }
    None
}

/// Generates a fresh agent id. Monotonicity of the clock plus the registry
/// mutex held across allocation (see `Registry::register`) prevents ties.
pub fn generate_agent_id() -> String {
    format!("agent-{}", now_nanos())
}

pub fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos()
}
