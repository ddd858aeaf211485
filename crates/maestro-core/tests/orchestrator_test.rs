//! End-to-end orchestration tests: decompose, dispatch, collect results,
//! retry, and merge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use maestro_core::broker::message::{Message, MessageType};
use maestro_core::broker::{handler, Broker, BrokerConfig};
use maestro_core::budget::{BudgetConfig, BudgetManager};
use maestro_core::memory::{MemoryConfig, MemoryStore};
use maestro_core::orchestrator::{Orchestrator, Planner};
use maestro_core::registry::{AgentRole, Registry};
use maestro_core::scheduler::SchedulerConfig;
use maestro_core::task::{TaskStatus, TaskType};
use maestro_core::worktree::merge::MergeResolver;
use maestro_core::worktree::WorktreeManager;
use maestro_test_utils::{commit_file, create_temp_repo, FailingPlanner, ScriptedPlanner};

// ===========================================================================
// Fixture
// ===========================================================================

struct Fixture {
    registry: Arc<Registry>,
    broker: Arc<Broker>,
    orchestrator: Orchestrator,
}

impl Fixture {
    fn new(planner: Arc<dyn Planner>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let registry = Arc::new(Registry::new());
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let budget = Arc::new(BudgetManager::new(BudgetConfig::default()));
        let memory = Arc::new(MemoryStore::new(MemoryConfig::default()));

        let orchestrator = Orchestrator::new(
            planner,
            Arc::clone(&registry),
            Arc::clone(&broker),
            SchedulerConfig::default(),
            budget,
            memory,
        );

        Self {
            registry,
            broker,
            orchestrator,
        }
    }

    /// Register a worker that answers every assignment, failing the first
    /// `failures_before_success` attempts it sees.
    fn spawn_worker(&self, agent_id: &str, role: AgentRole, failures_before_success: u32) {
        self.registry.register(agent_id, role, agent_id);
        let broker = Arc::clone(&self.broker);
        let failures = Arc::new(AtomicU32::new(failures_before_success));
        let worker_id = agent_id.to_string();
        let maestro = self.orchestrator.agent_id().to_string();

        self.broker.subscribe(
            &format!("agent:{agent_id}"),
            handler(move |msg: Message| {
                let broker = Arc::clone(&broker);
                let failures = Arc::clone(&failures);
                let worker_id = worker_id.clone();
                let maestro = maestro.clone();
                async move {
                    if msg.message_type != MessageType::TaskAssign {
                        return;
                    }
                    let task_id = msg.payload["task"]["id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();

                    let fail = failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                        .is_ok();

                    let result = Message::task_result(
                        &worker_id,
                        &maestro,
                        &task_id,
                        !fail,
                        serde_json::json!({"worker": worker_id}),
                        vec![],
                        fail.then(|| "simulated failure".to_string()),
                        0.05,
                    );
                    broker.publish(result);
                }
            }),
        );
    }

    /// Drive cycles and message processing until the project settles or the
    /// round budget runs out.
    async fn drive_until<F: Fn(&Orchestrator) -> bool>(&self, rounds: usize, done: F) {
        for _ in 0..rounds {
            self.orchestrator.run_cycle();
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.orchestrator.process_messages().await;
            if done(&self.orchestrator) {
                return;
            }
        }
        panic!("project did not settle within {rounds} rounds");
    }
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn single_task_happy_path() {
    let fixture = Fixture::new(Arc::new(ScriptedPlanner::single_task("Add health endpoint")));
    fixture.spawn_worker("backend-1", AgentRole::Backend, 0);

    let tasks = fixture
        .orchestrator
        .decompose_goal("Add health endpoint", &serde_json::Map::new())
        .await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::WriteCode);

    fixture
        .drive_until(10, |orch| orch.is_complete())
        .await;

    let status = fixture.orchestrator.project_status();
    assert_eq!(status.total_tasks, 1);
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 0);
    assert_eq!(status.pending, 0);
    assert_eq!(status.running, 0);

    let metrics = fixture.orchestrator.scheduler().metrics_for("backend-1");
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 0);

    let task = fixture.orchestrator.task("task-1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert!(task.result.as_ref().unwrap().success);
}

// ===========================================================================
// Dependencies across cycles
// ===========================================================================

#[tokio::test]
async fn dependent_tasks_dispatch_in_order() {
    let planner = ScriptedPlanner::new(
        serde_json::json!({
            "tasks": [
                {"name": "Design", "type": "design"},
                {"name": "Implement", "type": "write_code", "dependencies": ["task-1"]},
                {"name": "Test", "type": "write_tests", "dependencies": ["task-2"]}
            ]
        })
        .to_string(),
    );
    let fixture = Fixture::new(Arc::new(planner));
    fixture.spawn_worker("architect-1", AgentRole::Architect, 0);
    fixture.spawn_worker("backend-1", AgentRole::Backend, 0);
    fixture.spawn_worker("tester-1", AgentRole::TestEngineer, 0);

    let tasks = fixture
        .orchestrator
        .decompose_goal("Build the feature", &serde_json::Map::new())
        .await;
    assert_eq!(tasks.len(), 3);

    // Only the root is ready at the start.
    let ready: Vec<String> = fixture
        .orchestrator
        .next_ready()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec!["task-1"]);

    let order = fixture.orchestrator.execution_order();
    assert_eq!(order, vec!["task-1", "task-2", "task-3"]);

    fixture.drive_until(20, |orch| orch.is_complete()).await;

    let status = fixture.orchestrator.project_status();
    assert_eq!(status.completed, 3);
    assert_eq!(status.failed, 0);
}

// ===========================================================================
// Retry policy
// ===========================================================================

#[tokio::test]
async fn failed_task_is_retried_until_it_succeeds() {
    let fixture = Fixture::new(Arc::new(ScriptedPlanner::single_task("Flaky work")));
    fixture.spawn_worker("backend-1", AgentRole::Backend, 1);

    fixture
        .orchestrator
        .decompose_goal("Flaky work", &serde_json::Map::new())
        .await;

    fixture.drive_until(20, |orch| orch.is_complete()).await;

    let task = fixture.orchestrator.task("task-1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 2, "one failure, one success");

    // The failure left a lesson in episodic memory.
    let reflections = fixture
        .orchestrator
        .memory()
        .reflections_for_task("task-1")
        .await;
    assert_eq!(reflections.len(), 1);
    assert!(reflections[0].critique.contains("simulated failure"));

    let metrics = fixture.orchestrator.scheduler().metrics_for("backend-1");
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 1);

    // The eventual success clears the failure record.
    let status = fixture.orchestrator.project_status();
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 0);
}

#[tokio::test]
async fn exhausted_attempts_leave_the_task_failed() {
    let planner = ScriptedPlanner::new(
        serde_json::json!({
            "tasks": [{"name": "Doomed", "type": "write_code"}]
        })
        .to_string(),
    );
    let fixture = Fixture::new(Arc::new(planner));
    // Fails forever.
    fixture.spawn_worker("backend-1", AgentRole::Backend, u32::MAX);

    fixture
        .orchestrator
        .decompose_goal("Doomed work", &serde_json::Map::new())
        .await;

    fixture
        .drive_until(20, |orch| {
            orch.task("task-1")
                .is_some_and(|t| t.status == TaskStatus::Failed && !t.can_retry())
        })
        .await;

    let task = fixture.orchestrator.task("task-1").unwrap();
    assert_eq!(task.attempt_count, task.max_attempts);
    let failed = fixture.orchestrator.failed_tasks();
    assert_eq!(
        failed.get("task-1").map(String::as_str),
        Some("simulated failure")
    );
    assert!(!fixture.orchestrator.is_complete());
}

#[tokio::test]
async fn timed_out_task_fails_and_requeues() {
    let fixture = Fixture::new(Arc::new(ScriptedPlanner::single_task("Slow work")));
    // A worker that never answers.
    fixture.registry.register("backend-1", AgentRole::Backend, "B1");
    fixture
        .broker
        .subscribe("agent:backend-1", handler(|_msg| async {}));

    fixture
        .orchestrator
        .decompose_goal("Slow work", &serde_json::Map::new())
        .await;
    assert_eq!(fixture.orchestrator.run_cycle(), 1);

    fixture.orchestrator.mark_timed_out("task-1").await;

    let task = fixture.orchestrator.task("task-1").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.result.as_ref().unwrap().error.as_deref(),
        Some("timeout")
    );
    assert!(task.can_retry());

    // The next cycle requeues and redispatches the task.
    assert_eq!(fixture.orchestrator.run_cycle(), 1);
    assert_eq!(
        fixture.orchestrator.task("task-1").unwrap().status,
        TaskStatus::Assigned
    );
}

// ===========================================================================
// Decomposition failure paths
// ===========================================================================

#[tokio::test]
async fn planner_failure_yields_no_tasks() {
    let fixture = Fixture::new(Arc::new(FailingPlanner));
    let tasks = fixture
        .orchestrator
        .decompose_goal("Anything", &serde_json::Map::new())
        .await;
    assert!(tasks.is_empty());
    assert_eq!(fixture.orchestrator.project_status().total_tasks, 0);
}

#[tokio::test]
async fn malformed_entries_are_skipped_valid_ones_land() {
    let planner = ScriptedPlanner::new(
        r#"{"tasks": [
            {"name": "Good", "type": "write_code"},
            "not an object",
            {"type": "design"}
        ]}"#,
    );
    let fixture = Fixture::new(Arc::new(planner));
    let tasks = fixture
        .orchestrator
        .decompose_goal("Partially valid", &serde_json::Map::new())
        .await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "Good");
}

// ===========================================================================
// Assignment failure leaves tasks eligible
// ===========================================================================

#[tokio::test]
async fn no_agent_for_role_keeps_the_task_pending() {
    let planner = ScriptedPlanner::new(
        serde_json::json!({
            "tasks": [{"name": "Audit", "type": "security_audit"}]
        })
        .to_string(),
    );
    let fixture = Fixture::new(Arc::new(planner));
    // Only a backend is registered; the audit has no candidate.
    fixture.spawn_worker("backend-1", AgentRole::Backend, 0);

    fixture
        .orchestrator
        .decompose_goal("Audit the service", &serde_json::Map::new())
        .await;

    assert_eq!(fixture.orchestrator.run_cycle(), 0);
    let task = fixture.orchestrator.task("task-1").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    // The auditor shows up late; the next cycle picks the task up.
    fixture.spawn_worker("auditor-1", AgentRole::SecurityAuditor, 0);
    assert_eq!(fixture.orchestrator.run_cycle(), 1);
}

// ===========================================================================
// Merge coordination
// ===========================================================================

#[tokio::test]
async fn coordinate_merge_resolves_conflicts_source_wins() {
    let (_dir, repo) = create_temp_repo();
    commit_file(&repo, "app.py", "line 1\nline 2\nline 3\n", "Base");

    let mgr = WorktreeManager::new(&repo, None).unwrap();
    let wt = mgr.create("feat/a", Some("backend-1"), "main").unwrap();
    commit_file(&wt, "app.py", "line 1\nline 2\nX\n", "Agent: 3 -> X");
    mgr.remove(&wt, true).unwrap();
    commit_file(&repo, "app.py", "line 1\nline 2\nY\n", "Main: 3 -> Y");

    let fixture = Fixture::new(Arc::new(ScriptedPlanner::single_task("merge")));
    let orchestrator = fixture
        .orchestrator
        .with_merge_resolver(MergeResolver::new(&repo));

    let report = orchestrator.coordinate_merge("feat/a", "main");
    assert!(report.success, "merge failed: {:?}", report.error);
    assert_eq!(report.conflicts_found, 1);
    assert_eq!(report.conflicts_resolved, 1);

    let content = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(content, "line 1\nline 2\nX\n");
}

#[tokio::test]
async fn merge_without_repository_reports_failure() {
    let fixture = Fixture::new(Arc::new(ScriptedPlanner::single_task("no repo")));
    let report = fixture.orchestrator.coordinate_merge("feat/a", "main");
    assert!(!report.success);
    assert!(report.error.is_some());
}
