//! Agent registry: the authoritative record of registered worker agents.
//!
//! The registry exclusively owns `AgentRecord`s. Reads hand out snapshots so
//! callers never hold the registry lock across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Specialized roles an agent can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Maestro,
    Architect,
    Backend,
    Frontend,
    Database,
    TestEngineer,
    SecurityAuditor,
    CodeReviewer,
    Devops,
    Documentation,
    Research,
    ProductAnalyst,
    MemoryCoordinator,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Maestro => "maestro",
            AgentRole::Architect => "architect",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Database => "database",
            AgentRole::TestEngineer => "test_engineer",
            AgentRole::SecurityAuditor => "security_auditor",
            AgentRole::CodeReviewer => "code_reviewer",
            AgentRole::Devops => "devops",
            AgentRole::Documentation => "documentation",
            AgentRole::Research => "research",
            AgentRole::ProductAnalyst => "product_analyst",
            AgentRole::MemoryCoordinator => "memory_coordinator",
        };
        f.write_str(s)
    }
}

/// Record of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Stable agent id.
    pub agent_id: String,
    pub role: AgentRole,
    /// Human-readable display name.
    pub name: String,
    /// Whether the agent is currently accepting assignments.
    pub available: bool,
    /// Broker channel serving as this agent's inbox.
    pub inbox_channel: String,
}

/// Thread-safe registry of agents, keyed by agent id.
///
/// Registration order is preserved: role queries return agents in the order
/// they were registered, which the scheduler's rotation relies on.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: HashMap<String, AgentRecord>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Returns the inbox channel name (`agent:<id>`).
    /// Re-registering an existing id refreshes the record in place.
    pub fn register(&self, agent_id: &str, role: AgentRole, name: &str) -> String {
        let inbox = format!("agent:{agent_id}");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = !inner.agents.contains_key(agent_id);
        inner.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                agent_id: agent_id.to_string(),
                role,
                name: name.to_string(),
                available: true,
                inbox_channel: inbox.clone(),
            },
        );
        if fresh {
            inner.order.push(agent_id.to_string());
        }
        tracing::info!(agent_id, role = %role, "agent registered");
        inbox
    }

    /// Remove an agent. Returns the removed record.
    pub fn unregister(&self, agent_id: &str) -> Option<AgentRecord> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = inner.agents.remove(agent_id);
        if record.is_some() {
            inner.order.retain(|id| id != agent_id);
            tracing::info!(agent_id, "agent unregistered");
        }
        record
    }

    /// Flip an agent's availability. Returns false if the agent is unknown.
    pub fn set_available(&self, agent_id: &str, available: bool) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.agents.get_mut(agent_id) {
            Some(record) => {
                record.available = available;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.agents.get(agent_id).cloned()
    }

    /// Snapshot of available agents with the given role, in registration
    /// order.
    pub fn get_available(&self, role: AgentRole) -> Vec<AgentRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id))
            .filter(|a| a.available && a.role == role)
            .cloned()
            .collect()
    }

    /// Snapshot of every registered agent, in registration order.
    pub fn list(&self) -> Vec<AgentRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
