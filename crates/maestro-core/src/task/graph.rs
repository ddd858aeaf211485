//! Task dependency graph with cycle prevention.
//!
//! Tasks form a DAG: nodes are tasks, edges run from a dependency to its
//! dependents. Dependencies may reference ids that have not been added yet
//! (decomposition emits tasks one at a time); such tasks simply never become
//! ready until the dependency arrives and completes. Every `add_task`
//! re-validates acyclicity, and a rejected add leaves no partial mutation
//! behind.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::{Task, TaskStatus};

/// Errors from graph mutations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A task referenced itself in its dependency set.
    #[error("task {task:?} has invalid dependency {dependency:?}")]
    InvalidDependency { task: String, dependency: String },

    /// Adding the task would close a dependency cycle.
    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    /// A task with this id is already present.
    #[error("duplicate task id: {0:?}")]
    DuplicateTask(String),
}

/// The dependency graph owned by the orchestrator.
///
/// `edges` maps a task id to the set of tasks that depend on it, so that
/// completing a task leads directly to the candidates it may unblock. Edge
/// keys may be dangling (a dependency that has not been added); dangling
/// keys contribute nothing to readiness or cycle checks.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    edges: HashMap<String, HashSet<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, rejecting self-dependencies and any add that would close
    /// a cycle. On rejection the graph is left exactly as it was before the
    /// call.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id));
        }

        for dep in &task.dependencies {
            if *dep == task.id {
                return Err(GraphError::InvalidDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let id = task.id.clone();
        let deps = task.dependencies.clone();
        // An earlier task may already have registered `id` as a dangling
        // dependency; that entry must survive a rollback.
        let had_edge_entry = self.edges.contains_key(&id);

        self.tasks.insert(id.clone(), task);
        self.edges.entry(id.clone()).or_default();
        for dep in &deps {
            self.edges.entry(dep.clone()).or_default().insert(id.clone());
        }

        if let Some(cycle) = self.find_cycle() {
            self.tasks.remove(&id);
            if !had_edge_entry {
                self.edges.remove(&id);
            }
            for dep in &deps {
                if let Some(dependents) = self.edges.get_mut(dep) {
                    dependents.remove(&id);
                }
            }
            return Err(GraphError::CycleDetected(cycle.join(", ")));
        }

        Ok(())
    }

    /// Remove a task and all edges pointing at it. Returns the removed task.
    pub fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        let task = self.tasks.remove(task_id)?;
        self.edges.remove(task_id);
        for dependents in self.edges.values_mut() {
            dependents.remove(task_id);
        }
        Some(task)
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Tasks that directly depend on `task_id`.
    pub fn dependents_of(&self, task_id: &str) -> Vec<&Task> {
        self.edges
            .get(task_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Dependencies referenced by present tasks that have no node yet,
    /// as `(task_id, missing_dependency)` pairs.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if !self.tasks.contains_key(dep) {
                    missing.push((task.id.clone(), dep.clone()));
                }
            }
        }
        missing.sort();
        missing
    }

    /// Tasks in `pending` or `queued` whose dependencies are all in
    /// `completed`, ordered by priority descending then creation time
    /// ascending.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Queued))
            .filter(|t| t.is_ready(completed))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .weight()
                .cmp(&a.priority.weight())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready
    }

    /// Tasks in dependency order (Kahn's algorithm). Within a level, higher
    /// priority first, then older creation time.
    pub fn topological_sort(&self) -> Vec<&Task> {
        let mut in_degree = self.in_degrees();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let sort_key = |id: &str| {
            let t = &self.tasks[id];
            (std::cmp::Reverse(t.priority.weight()), t.created_at)
        };

        let mut result = Vec::with_capacity(self.tasks.len());
        while !queue.is_empty() {
            queue.sort_by_key(|id| sort_key(id));
            let id = queue.remove(0);
            result.push(&self.tasks[id]);

            if let Some(dependents) = self.edges.get(id) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(dependent.as_str());
                        }
                    }
                }
            }
        }

        result
    }

    /// Aggregate task counts by status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// In-degree per node, counting only dependencies that exist as nodes.
    fn in_degrees(&self) -> HashMap<&str, usize> {
        let mut in_degree: HashMap<&str, usize> =
            self.tasks.keys().map(|id| (id.as_str(), 0)).collect();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if self.tasks.contains_key(dep) {
                    *in_degree.get_mut(task.id.as_str()).expect("node exists") += 1;
                }
            }
        }
        in_degree
    }

    /// Detect a cycle with Kahn's algorithm; returns the ids left with
    /// non-zero in-degree when one exists.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut in_degree = self.in_degrees();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(dependents) = self.edges.get(id) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        if visited == self.tasks.len() {
            None
        } else {
            let mut stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            stuck.sort();
            Some(stuck)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskPriority, TaskType};

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, id, TaskType::WriteCode);
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn self_dependency_is_invalid() {
        let mut graph = TaskGraph::new();
        let err = graph.add_task(task("t1", &["t1"])).unwrap_err();
        assert!(matches!(err, GraphError::InvalidDependency { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn forward_dependency_is_tolerated() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t2", &["t1"])).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph.missing_dependencies(),
            vec![("t2".to_string(), "t1".to_string())]
        );

        // The dangling task never becomes ready.
        assert!(graph.ready(&HashSet::new()).is_empty());

        graph.add_task(task("t1", &[])).unwrap();
        assert!(graph.missing_dependencies().is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t1", &[])).unwrap();
        let err = graph.add_task(task("t1", &[])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask(_)));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn two_node_cycle_rejects_second_add() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t1", &["t2"])).unwrap();
        let err = graph.add_task(task("t2", &["t1"])).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
        assert_eq!(graph.len(), 1);

        // The dangling edge from the first add must survive the rollback so
        // a later, acyclic t2 still connects.
        graph.add_task(task("t2", &[])).unwrap();
        assert_eq!(
            graph.dependents_of("t2").iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["t1"]
        );
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a", &[])).unwrap();
        graph.add_task(task("b", &["a", "c"])).unwrap();
        let err = graph.add_task(task("c", &["b"])).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn ready_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t1", &[])).unwrap();
        graph.add_task(task("t2", &["t1"])).unwrap();
        graph.add_task(task("t3", &["t2"])).unwrap();

        let mut completed = HashSet::new();
        let ids = |v: Vec<&Task>| v.iter().map(|t| t.id.clone()).collect::<Vec<_>>();

        assert_eq!(ids(graph.ready(&completed)), vec!["t1"]);
        completed.insert("t1".to_string());
        graph.get_mut("t1").unwrap().status = TaskStatus::Completed;
        assert_eq!(ids(graph.ready(&completed)), vec!["t2"]);

        completed.insert("t2".to_string());
        graph.get_mut("t2").unwrap().status = TaskStatus::Completed;
        assert_eq!(ids(graph.ready(&completed)), vec!["t3"]);
    }

    #[test]
    fn ready_orders_by_priority_then_age() {
        let mut graph = TaskGraph::new();
        let mut low = task("low", &[]);
        low.priority = TaskPriority::Low;
        let mut crit = task("crit", &[]);
        crit.priority = TaskPriority::Critical;
        let normal = task("normal", &[]);

        graph.add_task(low).unwrap();
        graph.add_task(normal).unwrap();
        graph.add_task(crit).unwrap();

        let order: Vec<&str> = graph
            .ready(&HashSet::new())
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order, vec!["crit", "normal", "low"]);
    }

    #[test]
    fn topological_sort_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t1", &[])).unwrap();
        graph.add_task(task("t2", &["t1"])).unwrap();
        graph.add_task(task("t3", &["t2"])).unwrap();

        let order: Vec<&str> = graph
            .topological_sort()
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn diamond_sorts_every_node_once() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a", &[])).unwrap();
        graph.add_task(task("b", &["a"])).unwrap();
        graph.add_task(task("c", &["a"])).unwrap();
        graph.add_task(task("d", &["b", "c"])).unwrap();

        let order: Vec<&str> = graph
            .topological_sort()
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order.len(), 4);
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn remove_task_drops_edges() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("t1", &[])).unwrap();
        graph.add_task(task("t2", &["t1"])).unwrap();

        let removed = graph.remove_task("t2").unwrap();
        assert_eq!(removed.id, "t2");
        assert!(graph.dependents_of("t1").is_empty());
    }
}
