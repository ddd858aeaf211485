//! Key builders for the persisted-state scheme.
//!
//! Layout:
//! - `memory:<project>:short:<id>` — short-term items, TTL-bound
//! - `memory:<project>:long:<id>` / `memory:<project>:episodic:<id>` — no TTL
//! - `memory:<project>:index:<type>` — per-partition id sets
//! - `state:<agent>` — agent state snapshots, 24 h TTL

use std::time::Duration;

/// TTL applied to `state:<agent>` records.
pub const AGENT_STATE_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Key for a memory item in the named partition (`short`, `long`,
/// `episodic`).
pub fn memory_key(project_id: &str, memory_type: &str, memory_id: &str) -> String {
    format!("memory:{project_id}:{memory_type}:{memory_id}")
}

pub fn short_term(project_id: &str, memory_id: &str) -> String {
    memory_key(project_id, "short", memory_id)
}

pub fn long_term(project_id: &str, memory_id: &str) -> String {
    memory_key(project_id, "long", memory_id)
}

pub fn episodic(project_id: &str, memory_id: &str) -> String {
    memory_key(project_id, "episodic", memory_id)
}

/// Set key indexing all item ids of one partition.
pub fn partition_index(project_id: &str, memory_type: &str) -> String {
    format!("memory:{project_id}:index:{memory_type}")
}

/// Key for an agent's persisted state snapshot.
pub fn agent_state(agent_id: &str) -> String {
    format!("state:{agent_id}")
}
