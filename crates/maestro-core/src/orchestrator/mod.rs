//! The orchestrator: turns a goal into a scheduled, monitored execution.
//!
//! A goal is decomposed into a task graph by the external planning
//! collaborator, ready tasks are dispatched through the scheduler each
//! cycle, results flow back over the broker, and failures are retried until
//! their attempt budget runs out. Merges of agent branches are coordinated
//! through the merge resolver, and lessons from failures land in episodic
//! memory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::broker::message::{Message, MessageType};
use crate::broker::{handler, Broker};
use crate::budget::BudgetManager;
use crate::memory::{MemoryStore, Reflection};
use crate::registry::{AgentRole, Registry};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::task::graph::TaskGraph;
use crate::task::{Task, TaskPriority, TaskResult, TaskStatus, TaskType};
use crate::worktree::merge::{MergeOutcome, MergeResolver, MergeStrategy};

/// External planning collaborator. Given a goal and context it returns a
/// structured reply carrying a task list.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, context: &Map<String, Value>) -> anyhow::Result<String>;
}

/// Aggregate project status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub status_breakdown: HashMap<String, usize>,
    pub assigned_agents: usize,
    pub token_usage: u64,
}

/// Outcome of a coordinated merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub success: bool,
    pub conflicts_found: usize,
    pub conflicts_resolved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct OrchestratorState {
    graph: TaskGraph,
    completed: HashSet<String>,
    failed: HashMap<String, String>,
    assigned: HashMap<String, String>,
}

/// The orchestrator. Exclusively owns the task graph; every read and
/// mutation goes through its lock.
pub struct Orchestrator {
    id: String,
    project_id: Option<String>,
    planner: Arc<dyn Planner>,
    registry: Arc<Registry>,
    broker: Arc<Broker>,
    scheduler: Scheduler,
    budget: Arc<BudgetManager>,
    memory: Arc<MemoryStore>,
    merge_resolver: Option<MergeResolver>,
    state: Mutex<OrchestratorState>,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Orchestrator {
    /// Build an orchestrator and subscribe its inbox channel on the broker.
    /// Must be called within a tokio runtime.
    pub fn new(
        planner: Arc<dyn Planner>,
        registry: Arc<Registry>,
        broker: Arc<Broker>,
        scheduler_config: SchedulerConfig,
        budget: Arc<BudgetManager>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        let id = "maestro".to_string();
        registry.register(&id, AgentRole::Maestro, "Maestro");

        let (tx, rx) = mpsc::unbounded_channel();
        broker.subscribe(
            &format!("agent:{id}"),
            handler(move |msg: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                }
            }),
        );

        let scheduler = Scheduler::new(Arc::clone(&registry), Arc::clone(&broker), scheduler_config);

        Self {
            id,
            project_id: None,
            planner,
            registry,
            broker,
            scheduler,
            budget,
            memory,
            merge_resolver: None,
            state: Mutex::new(OrchestratorState::default()),
            inbox: Mutex::new(rx),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Attach the merge resolver for the shared repository.
    pub fn with_merge_resolver(mut self, resolver: MergeResolver) -> Self {
        self.merge_resolver = Some(resolver);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Decompose a goal into tasks via the planning collaborator and add
    /// them to the graph.
    ///
    /// Planner failure yields an empty list. Unparseable task entries are
    /// logged and skipped; an entry whose add would close a cycle is
    /// rejected with no partial graph mutation.
    pub async fn decompose_goal(&self, goal: &str, context: &Map<String, Value>) -> Vec<Task> {
        let reply = match self.planner.plan(goal, context).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "goal decomposition failed");
                return Vec::new();
            }
        };

        let parsed = parse_planner_reply(&reply, context, self.project_id.as_deref());
        let mut added = Vec::new();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for task in parsed {
            let id = task.id.clone();
            match state.graph.add_task(task) {
                Ok(()) => {
                    let task = state.graph.get(&id).expect("just added").clone();
                    added.push(task);
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "skipping task from decomposition");
                }
            }
        }

        tracing::info!(goal, tasks = added.len(), "goal decomposed");
        added
    }

    /// Add a pre-built task directly to the graph.
    pub fn add_task(&self, task: Task) -> Result<(), crate::task::graph::GraphError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.graph.add_task(task)
    }

    /// Tasks ready for dispatch, priority-ordered.
    pub fn next_ready(&self) -> Vec<Task> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .graph
            .ready(&state.completed)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Tasks in dependency order.
    pub fn execution_order(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .graph
            .topological_sort()
            .into_iter()
            .map(|t| t.id.clone())
            .collect()
    }

    /// Run one scheduling cycle: reset per-cycle caps, requeue retryable
    /// failures, dispatch every ready task. Returns the number dispatched.
    ///
    /// Assignment failures leave the task pending for the next cycle. A
    /// project-level budget stop halts the cycle entirely.
    pub fn run_cycle(&self) -> usize {
        if self.budget.project_budget().is_exceeded() {
            tracing::warn!("project token budget exhausted, cycle skipped");
            return 0;
        }

        self.scheduler.begin_cycle();

        // Failed tasks with attempts left go back to pending.
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let retryable: Vec<String> = state
                .graph
                .tasks()
                .filter(|t| t.can_retry())
                .map(|t| t.id.clone())
                .collect();
            for id in retryable {
                if let Some(task) = state.graph.get_mut(&id) {
                    tracing::info!(
                        task_id = %id,
                        attempt = task.attempt_count,
                        max_attempts = task.max_attempts,
                        "requeueing failed task for retry"
                    );
                    task.status = TaskStatus::Pending;
                }
                state.assigned.remove(&id);
            }
        }

        let ready: Vec<Task> = self.next_ready();
        let mut dispatched = 0;

        for task in ready {
            match self.scheduler.assign(&task, &self.id) {
                Ok(assignment) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state
                        .assigned
                        .insert(task.id.clone(), assignment.agent_id.clone());
                    if let Some(stored) = state.graph.get_mut(&task.id) {
                        stored.status = TaskStatus::Assigned;
                        stored.assigned_agent_id = Some(assignment.agent_id);
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    // The task stays pending; the next cycle retries it.
                    tracing::warn!(task_id = %task.id, error = %e, "assignment failed");
                }
            }
        }

        dispatched
    }

    /// Record a terminal result for a task.
    pub async fn mark_complete(&self, task_id: &str, result: TaskResult) {
        let (agent_id, attempt) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let agent_id = state.assigned.get(task_id).cloned();

            let Some(task) = state.graph.get_mut(task_id) else {
                tracing::warn!(task_id, "result for unknown task dropped");
                return;
            };
            // A result implies the task entered execution.
            if task.status != TaskStatus::Running {
                task.mark_started();
            }
            task.mark_completed(result.clone());
            let attempt = task.attempt_count;

            if result.success {
                state.completed.insert(task_id.to_string());
                // A successful retry clears the earlier failure record.
                state.failed.remove(task_id);
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                state.failed.insert(task_id.to_string(), error);
            }
            (agent_id, attempt)
        };

        if let Some(agent_id) = &agent_id {
            self.scheduler.record_outcome(agent_id, result.success);
        }

        tracing::info!(task_id, success = result.success, "task completed");

        // Failures leave a lesson behind for later attempts.
        if !result.success {
            let critique = result
                .error
                .clone()
                .unwrap_or_else(|| "task failed without error detail".to_string());
            let reflection = Reflection::new(
                task_id,
                agent_id.as_deref().unwrap_or("unknown"),
                attempt,
                critique,
                String::new(),
            );
            self.memory.store_reflection(reflection).await;
        }
    }

    /// Fail a task whose execution exceeded its timeout. Its worker gets a
    /// cancellation out of band; here the task joins the failed set with a
    /// "timeout" error, and the normal retry policy applies.
    pub async fn mark_timed_out(&self, task_id: &str) {
        tracing::warn!(task_id, "task timed out");
        self.mark_complete(task_id, TaskResult::err("timeout")).await;
    }

    /// Drain the orchestrator inbox, handling task results and progress
    /// updates. Returns the number of messages processed.
    pub async fn process_messages(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            while let Ok(msg) = inbox.try_recv() {
                drained.push(msg);
            }
        }

        let processed = drained.len();
        for msg in drained {
            self.handle_message(msg).await;
        }
        processed
    }

    async fn handle_message(&self, message: Message) {
        match message.message_type {
            MessageType::TaskComplete | MessageType::TaskFailed | MessageType::TaskResult => {
                let Some(task_id) = message.payload.get("task_id").and_then(Value::as_str) else {
                    tracing::warn!(message_id = %message.id, "task result without task_id dropped");
                    return;
                };
                let success = message
                    .payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(message.message_type == MessageType::TaskComplete);
                let artifacts = message
                    .payload
                    .get("artifacts")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let result = TaskResult {
                    success,
                    output: message.payload.get("output").cloned(),
                    artifacts,
                    error: message
                        .payload
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    metrics: Map::new(),
                };
                self.mark_complete(task_id, result).await;
            }
            MessageType::TaskProgress => {
                let task_id = message.payload.get("task_id").and_then(Value::as_str);
                let progress = message.payload.get("progress").and_then(Value::as_f64);
                tracing::info!(task_id, progress, "task progress");
            }
            MessageType::AgentStatus => {
                tracing::debug!(sender = %message.sender_id, "agent status update");
            }
            other => {
                tracing::debug!(message_type = ?other, sender = %message.sender_id, "unhandled message");
            }
        }
    }

    /// Merge an agent branch into the target branch, auto-resolving
    /// conflicts with the source-wins strategy. An unresolvable merge is
    /// aborted, leaving the target untouched.
    pub fn coordinate_merge(&self, source_branch: &str, target_branch: &str) -> MergeReport {
        self.coordinate_merge_with(source_branch, target_branch, MergeStrategy::Theirs)
    }

    /// Like [`coordinate_merge`](Self::coordinate_merge) with an explicit
    /// strategy; `Combined` is only ever applied when passed here.
    pub fn coordinate_merge_with(
        &self,
        source_branch: &str,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> MergeReport {
        let Some(resolver) = &self.merge_resolver else {
            return MergeReport {
                success: false,
                conflicts_found: 0,
                conflicts_resolved: 0,
                error: Some("no merge resolver attached".to_string()),
            };
        };

        match resolver.merge_branch(source_branch, target_branch) {
            Ok(MergeOutcome::Clean) => MergeReport {
                success: true,
                conflicts_found: 0,
                conflicts_resolved: 0,
                error: None,
            },
            Ok(MergeOutcome::Conflicts(files)) => {
                let mut resolved = 0;
                let mut unresolved = Vec::new();
                for file in &files {
                    match resolver.auto_resolve(file, strategy) {
                        Ok(_) => resolved += 1,
                        Err(e) => {
                            tracing::error!(file, error = %e, "conflict resolution failed");
                            unresolved.push(file.clone());
                        }
                    }
                }

                tracing::info!(
                    source_branch,
                    target_branch,
                    resolved,
                    conflicts = files.len(),
                    "merge coordination finished conflict pass"
                );

                if unresolved.is_empty() {
                    let commit = resolver.commit_merge(&format!(
                        "Merge {source_branch} into {target_branch}"
                    ));
                    match commit {
                        Ok(()) => MergeReport {
                            success: true,
                            conflicts_found: files.len(),
                            conflicts_resolved: resolved,
                            error: None,
                        },
                        Err(e) => {
                            let _ = resolver.abort_merge();
                            MergeReport {
                                success: false,
                                conflicts_found: files.len(),
                                conflicts_resolved: resolved,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                } else {
                    let _ = resolver.abort_merge();
                    MergeReport {
                        success: false,
                        conflicts_found: files.len(),
                        conflicts_resolved: resolved,
                        error: Some(format!(
                            "unresolved conflicts in: {}",
                            unresolved.join(", ")
                        )),
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "merge failed");
                MergeReport {
                    success: false,
                    conflicts_found: 0,
                    conflicts_resolved: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Aggregate status snapshot.
    pub fn project_status(&self) -> ProjectStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let counts = state.graph.status_counts();
        let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);

        let status_breakdown = counts
            .iter()
            .map(|(status, n)| (status.to_string(), *n))
            .collect();

        ProjectStatus {
            total_tasks: state.graph.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            pending: count(TaskStatus::Pending) + count(TaskStatus::Queued),
            running: count(TaskStatus::Running) + count(TaskStatus::Assigned),
            status_breakdown,
            assigned_agents: state.assigned.len(),
            token_usage: self.budget.total_used(),
        }
    }

    /// A task snapshot by id.
    pub fn task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.graph.get(task_id).cloned()
    }

    /// Error strings of failed tasks.
    pub fn failed_tasks(&self) -> HashMap<String, String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failed.clone()
    }

    /// Whether every task in the graph reached success.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.graph.is_empty() && state.completed.len() == state.graph.len()
    }

    /// Number of agents visible in the registry.
    pub fn registered_agents(&self) -> usize {
        self.registry.len()
    }

    /// Handle to the broker for collaborators that publish directly.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

/// Parse the planner's structured reply into tasks.
///
/// The reply may wrap the JSON document in prose; everything between the
/// first `{` and the last `}` is treated as the document. Entries that are
/// not objects or lack a name are skipped with a warning.
fn parse_planner_reply(
    content: &str,
    context: &Map<String, Value>,
    project_id: Option<&str>,
) -> Vec<Task> {
    let Some(start) = content.find('{') else {
        tracing::warn!("planner reply contains no JSON document");
        return Vec::new();
    };
    let Some(end) = content.rfind('}') else {
        tracing::warn!("planner reply contains no JSON document");
        return Vec::new();
    };

    let document: Value = match serde_json::from_str(&content[start..=end]) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(error = %e, "planner reply is not valid JSON");
            return Vec::new();
        }
    };

    let Some(entries) = document.get("tasks").and_then(Value::as_array) else {
        tracing::warn!("planner reply has no task list");
        return Vec::new();
    };

    let mut tasks = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            tracing::warn!(index = i, "skipping non-object task entry");
            continue;
        };
        let Some(name) = obj.get("name").and_then(Value::as_str) else {
            tracing::warn!(index = i, "skipping task entry without name");
            continue;
        };

        let task_type = obj
            .get("type")
            .and_then(|v| serde_json::from_value::<TaskType>(v.clone()).ok())
            .unwrap_or(TaskType::WriteCode);

        let mut task = Task::new(format!("task-{}", i + 1), name, task_type);
        task.description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        task.target_role = obj
            .get("target_role")
            .and_then(|v| serde_json::from_value::<AgentRole>(v.clone()).ok());
        task.priority = obj
            .get("priority")
            .and_then(|v| serde_json::from_value::<TaskPriority>(v.clone()).ok())
            .unwrap_or(TaskPriority::Normal);
        task.complexity = obj
            .get("complexity")
            .and_then(Value::as_u64)
            .map(|c| c.clamp(1, 10) as u8)
            .unwrap_or(5);
        task.dependencies = obj
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.requirements = obj
            .get("requirements")
            .and_then(Value::as_array)
            .map(|reqs| {
                reqs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.context = context.clone();
        task.project_id = project_id.map(str::to_string);

        tasks.push(task);
    }

    tasks
}
