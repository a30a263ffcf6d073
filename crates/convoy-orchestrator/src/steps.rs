use crate::types::{TaskDefinition, TaskExecution};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle of one task inside a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for prerequisites, or for a retry backoff to end.
    Pending,
    /// An attempt is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with no retries left.
    Failed,
    /// Never run because a prerequisite failed permanently.
    Skipped,
}

impl StepStatus {
    /// Completed, failed or skipped.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Per-task state owned by a workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Id of the task this step runs.
    pub task_id: String,
    /// Prerequisite task ids.
    pub dependencies: Vec<String>,
    /// Current state.
    pub status: StepStatus,
    /// Attempts made so far, including the one in flight.
    pub attempts: u32,
    /// The latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecution>,
}

/// Dependency bookkeeping for one workflow execution.
///
/// A step is ready when it is pending, not in flight and every dependency
/// has completed. A step waiting out a retry backoff is pending but stays
/// in flight, so it is never dispatched twice.
#[derive(Debug, Default)]
pub(crate) struct StepGraph {
    order: Vec<String>,
    steps: HashMap<String, WorkflowStep>,
    in_flight: HashSet<String>,
}

impl StepGraph {
    /// Build the graph. Each task's own `dependencies` are merged with the
    /// entries of `extra` for the same id.
    pub fn new(tasks: &[TaskDefinition], extra: &HashMap<String, Vec<String>>) -> Self {
        let mut graph = Self::default();
        for task in tasks {
            let mut deps: Vec<String> = Vec::new();
            let from_map = extra.get(&task.id).into_iter().flatten();
            for dep in task.dependencies.iter().chain(from_map) {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            graph.order.push(task.id.clone());
            graph.steps.insert(
                task.id.clone(),
                WorkflowStep {
                    task_id: task.id.clone(),
                    dependencies: deps,
                    status: StepStatus::Pending,
                    attempts: 0,
                    execution: None,
                },
            );
        }
        graph
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// A step by task id.
    pub fn get(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.get(id)
    }

    /// Ready step ids in definition order.
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                !self.in_flight.contains(*id)
                    && self.steps.get(*id).is_some_and(|step| {
                        step.status == StepStatus::Pending
                            && step.dependencies.iter().all(|dep| {
                                self.steps
                                    .get(dep)
                                    .is_some_and(|d| d.status == StepStatus::Completed)
                            })
                    })
            })
            .cloned()
            .collect()
    }

    /// Returns the attempt number now in flight.
    pub fn mark_running(&mut self, id: &str) -> u32 {
        self.in_flight.insert(id.to_string());
        match self.steps.get_mut(id) {
            Some(step) => {
                step.status = StepStatus::Running;
                step.attempts += 1;
                step.attempts
            }
            None => 0,
        }
    }

    /// Back to pending while a retry waits out its backoff. The step stays
    /// in flight; [`mark_running`](Self::mark_running) starts the retry.
    /// Returns the number the upcoming attempt will have.
    pub fn schedule_retry(&mut self, id: &str, execution: TaskExecution) -> u32 {
        match self.steps.get_mut(id) {
            Some(step) => {
                step.status = StepStatus::Pending;
                step.execution = Some(execution);
                step.attempts + 1
            }
            None => 0,
        }
    }

    /// Record a successful attempt.
    pub fn mark_completed(&mut self, id: &str, execution: TaskExecution) {
        self.in_flight.remove(id);
        if let Some(step) = self.steps.get_mut(id) {
            step.status = StepStatus::Completed;
            step.execution = Some(execution);
        }
    }

    /// Fail `id` permanently and skip every step that depends on it,
    /// directly or transitively. Returns the skipped ids.
    pub fn mark_failed(&mut self, id: &str, execution: TaskExecution) -> Vec<String> {
        self.in_flight.remove(id);
        if let Some(step) = self.steps.get_mut(id) {
            step.status = StepStatus::Failed;
            step.execution = Some(execution);
        }

        let mut skipped = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(failed) = frontier.pop() {
            for dependent in &self.order {
                if self.in_flight.contains(dependent) {
                    continue;
                }
                let Some(step) = self.steps.get_mut(dependent) else {
                    continue;
                };
                if step.status == StepStatus::Pending && step.dependencies.contains(&failed) {
                    step.status = StepStatus::Skipped;
                    skipped.push(dependent.clone());
                    frontier.push(dependent.clone());
                }
            }
        }
        skipped
    }

    /// Whether every step is terminal.
    pub fn is_done(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }

    /// Steps that are completed, failed or skipped.
    pub fn terminal_count(&self) -> usize {
        self.steps.values().filter(|s| s.status.is_terminal()).count()
    }

    /// Pending steps that can never become ready.
    pub fn blocked_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                !self.in_flight.contains(*id)
                    && self
                        .steps
                        .get(*id)
                        .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .cloned()
            .collect()
    }

    /// Dependency ids that name no step of this workflow.
    pub fn unknown_dependencies(&self) -> Vec<String> {
        let mut unknown: Vec<String> = self
            .steps
            .values()
            .flat_map(|s| s.dependencies.iter())
            .filter(|dep| !self.steps.contains_key(*dep))
            .cloned()
            .collect();
        unknown.sort();
        unknown.dedup();
        unknown
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.order.iter().any(|id| self.dfs_cycle(id, &mut visited))
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(step) = self.steps.get(id) {
            for dep in &step.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Steps in definition order.
    pub fn snapshot(&self) -> Vec<WorkflowStep> {
        self.order
            .iter()
            .filter_map(|id| self.steps.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition::new(id, id, "worker").with_dependencies(deps.iter().copied())
    }

    fn done(id: &str) -> TaskExecution {
        TaskExecution::started(id, None, Utc::now())
    }

    #[test]
    fn test_chain_readiness() {
        let tasks = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let mut g = StepGraph::new(&tasks, &HashMap::new());
        assert_eq!(g.ready(), vec!["a"]);
        g.mark_running("a");
        assert!(g.ready().is_empty());
        g.mark_completed("a", done("a"));
        assert_eq!(g.ready(), vec!["b"]);
        g.mark_running("b");
        g.mark_completed("b", done("b"));
        assert_eq!(g.ready(), vec!["c"]);
        g.mark_running("c");
        g.mark_completed("c", done("c"));
        assert!(g.is_done());
    }

    #[test]
    fn test_merged_dependencies() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &[])];
        let extra = HashMap::from([("b".to_string(), vec!["a".to_string(), "c".to_string()])]);
        let g = StepGraph::new(&tasks, &extra);
        assert_eq!(g.get("b").unwrap().dependencies, vec!["a", "c"]);
        assert_eq!(g.ready(), vec!["a", "c"]);
    }

    #[test]
    fn test_retrying_step_is_not_ready() {
        let tasks = vec![task("a", &[])];
        let mut g = StepGraph::new(&tasks, &HashMap::new());
        assert_eq!(g.mark_running("a"), 1);
        assert_eq!(g.schedule_retry("a", done("a")), 2);
        assert_eq!(g.get("a").unwrap().status, StepStatus::Pending);
        assert!(g.ready().is_empty());
        assert!(g.blocked_ids().is_empty());

        assert_eq!(g.mark_running("a"), 2);
        assert_eq!(g.get("a").unwrap().status, StepStatus::Running);
    }

    #[test]
    fn test_failure_skips_transitively() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ];
        let mut g = StepGraph::new(&tasks, &HashMap::new());
        g.mark_running("a");
        g.mark_running("d");
        let skipped = g.mark_failed("a", done("a"));
        assert_eq!(skipped.len(), 2);
        assert!(skipped.contains(&"b".to_string()));
        assert!(skipped.contains(&"c".to_string()));
        assert_eq!(g.get("d").unwrap().status, StepStatus::Running);
        assert_eq!(g.terminal_count(), 3);
        g.mark_completed("d", done("d"));
        assert!(g.is_done());
    }

    #[test]
    fn test_cycle_detection() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let g = StepGraph::new(&tasks, &HashMap::new());
        assert!(g.has_cycle());
        assert!(g.ready().is_empty());
        assert_eq!(g.blocked_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_no_cycle_in_diamond() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let g = StepGraph::new(&tasks, &HashMap::new());
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_unknown_dependency() {
        let tasks = vec![task("a", &["ghost"])];
        let g = StepGraph::new(&tasks, &HashMap::new());
        assert_eq!(g.unknown_dependencies(), vec!["ghost"]);
        assert!(g.ready().is_empty());
    }

    #[test]
    fn test_empty_graph_is_done() {
        let g = StepGraph::new(&[], &HashMap::new());
        assert!(g.is_done());
        assert_eq!(g.len(), 0);
    }
}
