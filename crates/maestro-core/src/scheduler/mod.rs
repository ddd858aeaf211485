//! Weighted task assignment.
//!
//! Selects the best available worker for a task and dispatches a task-assign
//! message to its inbox channel. Scoring balances specialization, current
//! load, historical success rate, assignment recency, and a round-robin
//! rotation bonus, with a hard per-cycle cap per agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::broker::message::{Message, MessagePriority};
use crate::broker::Broker;
use crate::registry::{AgentRecord, AgentRole, Registry};
use crate::task::{Task, TaskPriority};

/// Scoring weights. Fixed; they sum to 1.0.
const W_SPECIALIZATION: f64 = 0.35;
const W_WORKLOAD: f64 = 0.25;
const W_SUCCESS: f64 = 0.20;
const W_RECENCY: f64 = 0.10;
const W_ROTATION: f64 = 0.10;

/// Errors from task assignment.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No available agent carries the target role.
    #[error("no agent available for role {role}")]
    NoAgentAvailable { role: AgentRole },

    /// The broker reported zero deliveries for the assignment message.
    #[error("task-assign delivery failed for agent {agent_id} (task {task_id})")]
    DeliveryFailed { agent_id: String, task_id: String },
}

/// Per-agent counters feeding the scoring formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentMetrics {
    pub assigned: u64,
    pub completed: u64,
    pub failed: u64,
    /// Assignments handed out in the current scheduling cycle.
    pub cycle_assigned: u32,
}

impl AgentMetrics {
    /// Tasks believed in flight, clamped at zero.
    pub fn active(&self) -> u64 {
        self.assigned.saturating_sub(self.completed + self.failed)
    }
}

/// Outcome of a successful assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub agent_id: String,
    pub score: f64,
    pub delivered: usize,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    metrics: HashMap<String, AgentMetrics>,
    round_robin_cursor: u64,
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on assignments per agent per cycle.
    pub max_tasks_per_cycle: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_cycle: 5,
        }
    }
}

/// The task scheduler.
///
/// A single `assign` call observes a consistent snapshot of the candidate
/// set, their metrics, and the rotation cursor, and mutates those metrics
/// before releasing the scheduling lock.
pub struct Scheduler {
    registry: Arc<Registry>,
    broker: Arc<Broker>,
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, broker: Arc<Broker>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            broker,
            config,
            inner: Mutex::new(SchedulerInner::default()),
        }
    }

    /// Resolve the role a task should be routed to: the explicit target
    /// role when present, else the fixed type table.
    pub fn target_role(task: &Task) -> AgentRole {
        task.target_role.unwrap_or_else(|| task.task_type.default_role())
    }

    /// Assign a task to the best-scoring available agent and publish the
    /// task-assign message to its inbox.
    ///
    /// On `DeliveryFailed` no metric is mutated, so the task stays eligible
    /// for re-assignment on the next cycle.
    pub fn assign(&self, task: &Task, sender_id: &str) -> Result<Assignment, SchedulerError> {
        let role = Self::target_role(task);
        let candidates = self.registry.get_available(role);
        if candidates.is_empty() {
            tracing::warn!(task_id = %task.id, role = %role, "no agent available");
            return Err(SchedulerError::NoAgentAvailable { role });
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<(usize, f64)> = None;
        for (idx, agent) in candidates.iter().enumerate() {
            let score = self.score(&inner, agent, role, idx, candidates.len());
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }

        let (winner_idx, score) = best.expect("candidate set is non-empty");
        let winner = &candidates[winner_idx];

        let message = Message::task_assign(
            sender_id,
            &winner.agent_id,
            task.to_assignment(),
            map_priority(task.priority),
        );
        let delivered = self.broker.publish(message);

        if delivered == 0 {
            tracing::warn!(
                task_id = %task.id,
                agent_id = %winner.agent_id,
                "assignment message reached no inbox"
            );
            return Err(SchedulerError::DeliveryFailed {
                agent_id: winner.agent_id.clone(),
                task_id: task.id.clone(),
            });
        }

        let metrics = inner.metrics.entry(winner.agent_id.clone()).or_default();
        metrics.assigned += 1;
        metrics.cycle_assigned += 1;
        inner.round_robin_cursor += 1;

        tracing::info!(
            task_id = %task.id,
            agent_id = %winner.agent_id,
            role = %role,
            score = format!("{score:.2}"),
            "task assigned"
        );

        Ok(Assignment {
            agent_id: winner.agent_id.clone(),
            score,
            delivered,
        })
    }

    /// Composite score in [0, 1] for one candidate.
    fn score(
        &self,
        inner: &SchedulerInner,
        agent: &AgentRecord,
        target_role: AgentRole,
        candidate_idx: usize,
        candidate_count: usize,
    ) -> f64 {
        let metrics = inner.metrics.get(&agent.agent_id).copied().unwrap_or_default();

        // Hard cap: an agent at its per-cycle limit is out of the running.
        if metrics.cycle_assigned >= self.config.max_tasks_per_cycle {
            return 0.0;
        }

        let specialization = if agent.role == target_role { 1.0 } else { 0.3 };

        let workload = 1.0 / (1.0 + metrics.active() as f64);

        let outcomes = metrics.completed + metrics.failed;
        let success = if outcomes > 0 {
            metrics.completed as f64 / outcomes as f64
        } else {
            0.5
        };

        let max_assigned = inner
            .metrics
            .values()
            .map(|m| m.assigned)
            .max()
            .unwrap_or(1)
            .max(1);
        let recency = 1.0 - metrics.assigned as f64 / max_assigned as f64;

        let expected_idx = (inner.round_robin_cursor % candidate_count as u64) as usize;
        let rotation = if candidate_idx == expected_idx { 1.0 } else { 0.3 };

        W_SPECIALIZATION * specialization
            + W_WORKLOAD * workload
            + W_SUCCESS * success
            + W_RECENCY * recency
            + W_ROTATION * rotation
    }

    /// Record a terminal outcome for the agent that held the task.
    pub fn record_outcome(&self, agent_id: &str, success: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let metrics = inner.metrics.entry(agent_id.to_string()).or_default();
        if success {
            metrics.completed += 1;
        } else {
            metrics.failed += 1;
        }
    }

    /// Reset every agent's per-cycle assignment counter.
    pub fn begin_cycle(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for metrics in inner.metrics.values_mut() {
            metrics.cycle_assigned = 0;
        }
    }

    /// Snapshot of one agent's metrics.
    pub fn metrics_for(&self, agent_id: &str) -> AgentMetrics {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.metrics.get(agent_id).copied().unwrap_or_default()
    }

    /// Current rotation cursor. Exposed for status reporting and tests.
    pub fn round_robin_cursor(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.round_robin_cursor
    }

    /// Sum of token-free aggregate counters across all agents.
    pub fn totals(&self) -> AgentMetrics {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut total = AgentMetrics::default();
        for m in inner.metrics.values() {
            total.assigned += m.assigned;
            total.completed += m.completed;
            total.failed += m.failed;
        }
        total
    }
}

fn map_priority(priority: TaskPriority) -> MessagePriority {
    match priority {
        TaskPriority::Low => MessagePriority::Low,
        TaskPriority::Normal => MessagePriority::Normal,
        TaskPriority::High => MessagePriority::High,
        TaskPriority::Critical => MessagePriority::Urgent,
    }
}
