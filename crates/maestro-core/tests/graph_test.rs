//! Tests for the task graph: readiness, ordering, and cycle safety.

use std::collections::HashSet;

use maestro_core::task::graph::{GraphError, TaskGraph};
use maestro_core::task::{Task, TaskPriority, TaskStatus, TaskType};

fn task(id: &str, deps: &[&str]) -> Task {
    let mut t = Task::new(id, id, TaskType::WriteCode);
    t.dependencies = deps.iter().map(|d| d.to_string()).collect();
    t
}

fn ids(tasks: Vec<&Task>) -> Vec<String> {
    tasks.iter().map(|t| t.id.clone()).collect()
}

// ===========================================================================
// Dependency ordering
// ===========================================================================

#[test]
fn ready_walks_the_chain_as_tasks_complete() {
    let mut graph = TaskGraph::new();
    graph.add_task(task("t1", &[])).unwrap();
    graph.add_task(task("t2", &["t1"])).unwrap();
    graph.add_task(task("t3", &["t2"])).unwrap();

    let mut completed = HashSet::new();
    assert_eq!(ids(graph.ready(&completed)), vec!["t1"]);

    graph.get_mut("t1").unwrap().status = TaskStatus::Completed;
    completed.insert("t1".to_string());
    assert_eq!(ids(graph.ready(&completed)), vec!["t2"]);

    graph.get_mut("t2").unwrap().status = TaskStatus::Completed;
    completed.insert("t2".to_string());
    assert_eq!(ids(graph.ready(&completed)), vec!["t3"]);
}

#[test]
fn topological_sort_is_a_dependency_respecting_permutation() {
    let mut graph = TaskGraph::new();
    graph.add_task(task("t1", &[])).unwrap();
    graph.add_task(task("t2", &["t1"])).unwrap();
    graph.add_task(task("t3", &["t2"])).unwrap();
    graph.add_task(task("t4", &["t1"])).unwrap();
    graph.add_task(task("t5", &["t3", "t4"])).unwrap();

    let order = ids(graph.topological_sort());
    assert_eq!(order.len(), 5);
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(pos("t1") < pos("t2"));
    assert!(pos("t2") < pos("t3"));
    assert!(pos("t1") < pos("t4"));
    assert!(pos("t3") < pos("t5"));
    assert!(pos("t4") < pos("t5"));
}

// ===========================================================================
// Cycle rejection
// ===========================================================================

#[test]
fn two_task_cycle_is_rejected_and_graph_survives() {
    let mut graph = TaskGraph::new();
    graph.add_task(task("t1", &["t2"])).unwrap();

    let err = graph.add_task(task("t2", &["t1"])).unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected(_)));
    assert_eq!(graph.len(), 1);
}

#[test]
fn graph_stays_acyclic_under_interleaved_adds_and_rejections() {
    let mut graph = TaskGraph::new();
    // A growing chain with periodic attempts to close a loop back to the
    // head. Every attempt must fail, every chain link must land.
    graph.add_task(task("n0", &[])).unwrap();
    for i in 1..20 {
        let id = format!("n{i}");
        let prev = format!("n{}", i - 1);
        graph.add_task(task(&id, &[prev.as_str()])).unwrap();

        if i % 5 == 0 {
            // n0 depends on the current tail: closes a loop.
            let result = graph.add_task(task("n0-loop", &[id.as_str(), "n0"]));
            assert!(result.is_ok(), "diamond-shaped add is not a cycle");
            graph.remove_task("n0-loop");

            let mut cyclic = task("cyclic", &[id.as_str()]);
            cyclic.dependencies.push("cyclic".to_string());
            assert!(matches!(
                graph.add_task(cyclic),
                Err(GraphError::InvalidDependency { .. })
            ));
        }
        // After every operation a topological sort covers all nodes, which
        // only holds for an acyclic graph.
        assert_eq!(graph.topological_sort().len(), graph.len());
    }
}

#[test]
fn self_dependency_never_enters_the_graph() {
    let mut graph = TaskGraph::new();
    let err = graph.add_task(task("t1", &["t1"])).unwrap_err();
    assert!(matches!(err, GraphError::InvalidDependency { .. }));
    assert!(graph.is_empty());
}

// ===========================================================================
// Readiness definition
// ===========================================================================

#[test]
fn ready_matches_its_definition_for_arbitrary_completed_sets() {
    let mut graph = TaskGraph::new();
    graph.add_task(task("a", &[])).unwrap();
    graph.add_task(task("b", &["a"])).unwrap();
    graph.add_task(task("c", &["a"])).unwrap();
    graph.add_task(task("d", &["b", "c"])).unwrap();

    let universe = ["a", "b", "c", "d"];
    // All 16 subsets of completed ids.
    for mask in 0..16u32 {
        let completed: HashSet<String> = universe
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, id)| id.to_string())
            .collect();

        let expected: HashSet<String> = graph
            .tasks()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Queued)
                    && t.dependencies.iter().all(|d| completed.contains(d))
            })
            .map(|t| t.id.clone())
            .collect();

        let actual: HashSet<String> = ids(graph.ready(&completed)).into_iter().collect();
        assert_eq!(actual, expected, "mismatch for completed={completed:?}");
    }
}

#[test]
fn non_pending_states_are_excluded_from_ready() {
    let mut graph = TaskGraph::new();
    graph.add_task(task("a", &[])).unwrap();
    graph.add_task(task("b", &[])).unwrap();
    graph.add_task(task("c", &[])).unwrap();

    graph.get_mut("a").unwrap().status = TaskStatus::Running;
    graph.get_mut("b").unwrap().status = TaskStatus::Queued;
    graph.get_mut("c").unwrap().status = TaskStatus::Cancelled;

    assert_eq!(ids(graph.ready(&HashSet::new())), vec!["b"]);
}

// ===========================================================================
// Serialization law
// ===========================================================================

#[test]
fn task_serializes_and_deserializes_identically() {
    let mut original = task("round", &["dep-1"]);
    original.priority = TaskPriority::Critical;
    original.tags = vec!["core".into()];
    original.requirements = vec!["requirement".into()];
    original.mark_started();

    let json = serde_json::to_string(&original).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();

    assert_eq!(back.id, original.id);
    assert_eq!(back.dependencies, original.dependencies);
    assert_eq!(back.priority, original.priority);
    assert_eq!(back.status, original.status);
    assert_eq!(back.attempt_count, original.attempt_count);
    assert_eq!(back.started_at, original.started_at);
    assert_eq!(back.tags, original.tags);
}
