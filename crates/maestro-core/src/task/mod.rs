//! Task definitions and the task status machine.
//!
//! Tasks are the fundamental units of work dispatched to agents. This module
//! enforces the allowed status transition graph, timestamp management, and
//! retry limits.

pub mod graph;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::AgentRole;

/// Types of tasks the orchestrator can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analyze,
    Design,
    Plan,
    Research,
    Implement,
    WriteCode,
    Refactor,
    FixBug,
    WriteTests,
    RunTests,
    CodeReview,
    SecurityAudit,
    Deploy,
    Document,
}

impl TaskType {
    /// The agent role this task type is routed to when no explicit target
    /// role is set on the task.
    pub fn default_role(self) -> AgentRole {
        match self {
            TaskType::Design => AgentRole::Architect,
            TaskType::Analyze => AgentRole::ProductAnalyst,
            TaskType::Research => AgentRole::Research,
            TaskType::WriteCode
            | TaskType::Implement
            | TaskType::FixBug
            | TaskType::Refactor
            | TaskType::Plan => AgentRole::Backend,
            TaskType::WriteTests | TaskType::RunTests => AgentRole::TestEngineer,
            TaskType::CodeReview => AgentRole::CodeReviewer,
            TaskType::SecurityAudit => AgentRole::SecurityAuditor,
            TaskType::Deploy => AgentRole::Devops,
            TaskType::Document => AgentRole::Documentation,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Analyze => "analyze",
            TaskType::Design => "design",
            TaskType::Plan => "plan",
            TaskType::Research => "research",
            TaskType::Implement => "implement",
            TaskType::WriteCode => "write_code",
            TaskType::Refactor => "refactor",
            TaskType::FixBug => "fix_bug",
            TaskType::WriteTests => "write_tests",
            TaskType::RunTests => "run_tests",
            TaskType::CodeReview => "code_review",
            TaskType::SecurityAudit => "security_audit",
            TaskType::Deploy => "deploy",
            TaskType::Document => "document",
        };
        f.write_str(s)
    }
}

/// Task priority levels. Serialized as their numeric weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl From<TaskPriority> for u8 {
    fn from(p: TaskPriority) -> u8 {
        match p {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 8,
            TaskPriority::Critical => 10,
        }
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(TaskPriority::Low),
            5 => Ok(TaskPriority::Normal),
            8 => Ok(TaskPriority::High),
            10 => Ok(TaskPriority::Critical),
            other => Err(format!("invalid task priority: {other}")),
        }
    }
}

impl TaskPriority {
    /// Numeric weight used for ordering.
    pub fn weight(self) -> u8 {
        self.into()
    }
}

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    WaitingDependency,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    /// Whether this status is terminal. `Failed` is terminal but admits the
    /// retry edge back to `Running` while attempts remain.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::WaitingDependency => "waiting_dependency",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Check whether a transition from `from` to `to` is a valid edge in the
/// status graph:
///
/// ```text
/// pending  -> queued
/// pending  -> assigned
/// queued   -> assigned
/// assigned -> running
/// running  -> completed
/// running  -> failed
/// failed   -> running   (in-place retry, while attempts remain)
/// failed   -> pending   (requeue for re-dispatch)
/// ```
///
/// Pause, dependency-wait, and cancellation edges branch off the main chain.
/// Completed and cancelled are sticky.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Assigned)
            | (Queued, Assigned)
            | (Assigned, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Running)
            | (Failed, Pending)
            | (Running, Paused)
            | (Paused, Running)
            | (Pending, WaitingDependency)
            | (WaitingDependency, Pending)
            | (Pending, Blocked)
            | (Blocked, Pending)
            | (Pending, Cancelled)
            | (Queued, Cancelled)
            | (Assigned, Cancelled)
            | (Running, Cancelled)
    )
}

/// Result of executing a task. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl TaskResult {
    /// A successful result with the given output.
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            artifacts: Vec::new(),
            error: None,
            metrics: Map::new(),
        }
    }

    /// A failed result carrying an error string.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            artifacts: Vec::new(),
            error: Some(error.into()),
            metrics: Map::new(),
        }
    }
}

/// A unit of work assigned to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Complexity rating on a 1-10 scale.
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    /// Explicit target role; when absent the type's default role applies.
    #[serde(default)]
    pub target_role: Option<AgentRole>,
    #[serde(default)]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens: u64,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_complexity() -> u8 {
    5
}

fn default_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_estimated_tokens() -> u64 {
    1000
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Create a new pending task with defaults.
    pub fn new(id: impl Into<String>, name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Normal,
            complexity: default_complexity(),
            target_role: None,
            assigned_agent_id: None,
            dependencies: Vec::new(),
            parent_task_id: None,
            project_id: None,
            context: Map::new(),
            requirements: Vec::new(),
            timeout_seconds: default_timeout(),
            max_attempts: default_max_attempts(),
            estimated_tokens: default_estimated_tokens(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            tags: Vec::new(),
        }
    }

    /// Whether every dependency id is in `completed`.
    pub fn is_ready(&self, completed: &std::collections::HashSet<String>) -> bool {
        self.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Transition into `running`, stamping `started_at` on first entry and
    /// advancing the attempt counter.
    pub fn mark_started(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.attempt_count += 1;
    }

    /// Terminal transition driven by the result's success flag.
    pub fn mark_completed(&mut self, result: TaskResult) {
        self.status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Mark failed with an error string.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.mark_completed(TaskResult::err(error));
    }

    /// Whether the failed-retry edge is still open.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempt_count < self.max_attempts
    }

    /// Actual execution duration, when both endpoints are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// The externalized view sent to an agent in a task-assign payload.
    pub fn to_assignment(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "type": self.task_type,
            "priority": self.priority,
            "complexity": self.complexity,
            "context": self.context,
            "requirements": self.requirements,
            "timeout_seconds": self.timeout_seconds,
            "attempt_number": self.attempt_count + 1,
            "max_attempts": self.max_attempts,
        })
    }
}
