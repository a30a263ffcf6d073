use crate::retry::RetryPolicy;
use crate::steps::{StepGraph, WorkflowStep};
use crate::types::{TaskDefinition, TaskExecution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{
    generate_id, BoundedLog, Clock, ConvoyError, ConvoyResult, EventEmitter, Payload, SystemClock,
};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Workflow event names.
pub mod events {
    /// A run started.
    pub const WORKFLOW_STARTED: &str = "workflow_started";
    /// A step completed.
    pub const WORKFLOW_TASK_COMPLETED: &str = "workflow_task_completed";
    /// A failed step will be retried after a backoff.
    pub const WORKFLOW_TASK_RETRY: &str = "workflow_task_retry";
    /// A step failed with no retries left.
    pub const WORKFLOW_TASK_FAILED: &str = "workflow_task_failed";
    /// A run completed.
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    /// A run failed.
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    /// Cancellation of a run was requested.
    pub const WORKFLOW_CANCELLED: &str = "workflow_cancelled";
}

/// Runs one task on behalf of a workflow.
///
/// Returning `Ok` with a failed execution and returning `Err` are both
/// treated as a failed attempt.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of `definition`.
    async fn execute_task(&self, definition: &TaskDefinition) -> ConvoyResult<TaskExecution>;
}

/// A DAG of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Steps, in definition order.
    pub tasks: Vec<TaskDefinition>,
    /// task id -> prerequisite ids, merged with each task's own `dependencies`.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    /// Retry policy shared by every step.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Carried for callers; not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowDefinition {
    /// A workflow with the default retry policy.
    pub fn new(id: impl Into<String>, name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            tasks,
            dependencies: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    /// Add prerequisites for `task_id`.
    pub fn with_dependency<I, S>(mut self, task_id: impl Into<String>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .insert(task_id.into(), deps.into_iter().map(Into::into).collect());
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Structural checks that do not depend on execution.
    pub fn validate(&self) -> ConvoyResult<()> {
        if self.id.trim().is_empty() {
            return Err(ConvoyError::Workflow("workflow id must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(ConvoyError::Workflow(format!(
                    "workflow '{}' declares task '{}' twice",
                    self.id, task.id
                )));
            }
        }
        if let Some(key) = self.dependencies.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(ConvoyError::Workflow(format!(
                "workflow '{}' declares dependencies for unknown task '{key}'",
                self.id
            )));
        }
        Ok(())
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> ConvoyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let definition: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content).map_err(|e| {
                ConvoyError::Workflow(format!("Failed to parse '{}': {e}", path.display()))
            })?,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Status of a [`WorkflowExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Steps are still running or waiting.
    Running,
    /// Every step completed.
    Completed,
    /// A step failed or the run was blocked.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl WorkflowStatus {
    /// Anything but `Running`.
    pub fn is_terminal(self) -> bool {
        self != WorkflowStatus::Running
    }
}

/// One invocation of a [`WorkflowDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// Unique execution id.
    pub id: String,
    /// Id of the definition being run.
    pub workflow_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Set once terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Steps that reached a terminal state.
    pub current_step: usize,
    /// Steps in the workflow.
    pub total_steps: usize,
    /// Percent of steps that are terminal.
    pub progress: f64,
    /// Results of completed steps, by task id.
    pub results: HashMap<String, Payload>,
    /// Final errors of failed steps, by task id.
    pub errors: HashMap<String, String>,
    /// Final attempt of each finished step.
    pub task_executions: HashMap<String, TaskExecution>,
    /// Per-step state.
    pub steps: Vec<WorkflowStep>,
    /// Set when the execution as a whole failed or was cancelled.
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Wall time of a finished run.
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }
}

/// Counters over all runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStats {
    /// Runs in progress.
    pub active: usize,
    /// Runs started.
    pub started: u64,
    /// Runs completed.
    pub completed: u64,
    /// Runs failed.
    pub failed: u64,
    /// Runs cancelled.
    pub cancelled: u64,
    /// Finished runs kept in history.
    pub retained: usize,
    /// Mean duration of finished runs.
    pub average_duration_ms: f64,
}

struct ActiveRun {
    execution: WorkflowExecution,
    cancel: Arc<CancelSignal>,
}

/// Cancellation flag of one run. Retries sleeping out a backoff are woken
/// as soon as the run is cancelled.
#[derive(Default)]
struct CancelSignal {
    flag: AtomicBool,
    wake: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `delay`. Returns `false` if the run was cancelled first.
    async fn sleep(&self, delay: Duration) -> bool {
        let woken = self.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            _ = woken => false,
        }
    }
}

#[derive(Default)]
struct Counters {
    started: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_duration_ms: u64,
}

enum Attempt {
    Finished(TaskExecution),
    /// The backoff before a retry is over.
    Due,
    /// A retry whose backoff was cut short by cancellation.
    Abandoned,
}

struct StepOutcome {
    task_id: String,
    attempt: Attempt,
}

/// Executes workflows step by step, running every ready step concurrently.
pub struct WorkflowEngine {
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<String, ActiveRun>>,
    history: Mutex<BoundedLog<WorkflowExecution>>,
    counters: Mutex<Counters>,
    events: EventEmitter<Payload>,
    stopping: AtomicBool,
    drained: Notify,
}

impl WorkflowEngine {
    /// An engine on the system clock keeping `history_limit` finished runs.
    pub fn new(history_limit: usize) -> Self {
        Self::with_clock(history_limit, SystemClock::shared())
    }

    /// An engine that reads time from `clock`.
    pub fn with_clock(history_limit: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(BoundedLog::new(history_limit)),
            counters: Mutex::new(Counters::default()),
            events: EventEmitter::new(),
            stopping: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Register a handler for a workflow event. See [`events`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Payload) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    /// Run `definition` to completion.
    ///
    /// Returns `Err` only when the definition is invalid or the engine is
    /// stopping. Step failures, blocked dependencies and cancellation all
    /// produce an `Ok` execution with a terminal status.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        executor: &dyn TaskExecutor,
        params: Option<Payload>,
    ) -> ConvoyResult<WorkflowExecution> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ConvoyError::Workflow("workflow engine is stopping".into()));
        }
        definition.validate()?;

        let tasks: HashMap<String, TaskDefinition> = definition
            .tasks
            .iter()
            .map(|t| {
                let mut task = t.clone();
                if let Some(params) = &params {
                    merge_params(&mut task.config, params);
                }
                (task.id.clone(), task)
            })
            .collect();
        let mut graph = StepGraph::new(&definition.tasks, &definition.dependencies);
        let policy = definition.retry_policy.clone();

        let exec_id = generate_id("wf_exec");
        let cancel = Arc::new(CancelSignal::default());
        let mut execution = WorkflowExecution {
            id: exec_id.clone(),
            workflow_id: definition.id.clone(),
            status: WorkflowStatus::Running,
            start_time: self.clock.now(),
            end_time: None,
            current_step: 0,
            total_steps: graph.len(),
            progress: 0.0,
            results: HashMap::new(),
            errors: HashMap::new(),
            task_executions: HashMap::new(),
            steps: graph.snapshot(),
            error: None,
        };
        self.active.lock().insert(
            exec_id.clone(),
            ActiveRun {
                execution: execution.clone(),
                cancel: Arc::clone(&cancel),
            },
        );
        self.counters.lock().started += 1;

        info!(
            execution_id = %exec_id,
            workflow = %definition.id,
            steps = graph.len(),
            "Workflow started"
        );
        self.events.emit_quiet(
            events::WORKFLOW_STARTED,
            &json!({ "executionId": exec_id, "workflowId": definition.id, "totalSteps": graph.len() }),
        );

        let mut in_flight: FuturesUnordered<BoxFuture<'_, StepOutcome>> = FuturesUnordered::new();
        let mut blocked: Option<String> = None;

        loop {
            if !cancel.is_cancelled() {
                let mut dispatched = false;
                for task_id in graph.ready() {
                    let Some(task) = tasks.get(&task_id) else {
                        continue;
                    };
                    let attempt = graph.mark_running(&task_id);
                    debug!(execution_id = %exec_id, task_id = %task_id, attempt, "Dispatching workflow step");
                    in_flight.push(self.run_step(executor, task.clone()));
                    dispatched = true;
                }
                if dispatched {
                    self.record_progress(&mut execution, &graph);
                }
            }

            if in_flight.is_empty() {
                if !graph.is_done() && !cancel.is_cancelled() {
                    let ids = graph.blocked_ids();
                    let mut reason = format!("Workflow blocked: tasks [{}] can never run", ids.join(", "));
                    let unknown = graph.unknown_dependencies();
                    if !unknown.is_empty() {
                        reason.push_str(&format!(" (unknown dependencies: {})", unknown.join(", ")));
                    } else if graph.has_cycle() {
                        reason.push_str(" (dependency cycle)");
                    }
                    blocked = Some(reason);
                }
                break;
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            let StepOutcome { task_id, attempt } = outcome;
            let task_execution = match attempt {
                Attempt::Finished(e) => e,
                Attempt::Due if !cancel.is_cancelled() => {
                    if let Some(task) = tasks.get(&task_id) {
                        let attempt = graph.mark_running(&task_id);
                        debug!(execution_id = %exec_id, task_id = %task_id, attempt, "Retrying workflow step");
                        in_flight.push(self.run_step(executor, task.clone()));
                        self.record_progress(&mut execution, &graph);
                    }
                    continue;
                }
                Attempt::Due | Attempt::Abandoned => {
                    graph.mark_failed(
                        &task_id,
                        TaskExecution::rejected(&task_id, "workflow cancelled", self.clock.now()),
                    );
                    continue;
                }
            };

            if task_execution.is_success() {
                let result = task_execution.result.clone().unwrap_or(Payload::Null);
                execution.results.insert(task_id.clone(), result.clone());
                execution
                    .task_executions
                    .insert(task_id.clone(), task_execution.clone());
                graph.mark_completed(&task_id, task_execution);
                debug!(execution_id = %exec_id, task_id = %task_id, "Workflow step completed");
                self.events.emit_quiet(
                    events::WORKFLOW_TASK_COMPLETED,
                    &json!({ "executionId": exec_id, "taskId": task_id, "result": result }),
                );
            } else {
                let reason = task_execution
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                let attempts = graph.get(&task_id).map(|s| s.attempts).unwrap_or(1);
                let retryable = attempts <= policy.max_retries && !cancel.is_cancelled();

                if let (true, Some(task)) = (retryable, tasks.get(&task_id)) {
                    let delay = policy.delay_for(attempts);
                    let next = graph.schedule_retry(&task_id, task_execution);
                    warn!(
                        execution_id = %exec_id,
                        task_id = %task_id,
                        attempt = next,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Workflow step failed, retrying"
                    );
                    self.events.emit_quiet(
                        events::WORKFLOW_TASK_RETRY,
                        &json!({
                            "executionId": exec_id,
                            "taskId": task_id,
                            "attempt": next,
                            "delayMs": delay.as_millis() as u64,
                        }),
                    );
                    in_flight.push(Self::wait_backoff(task.id.clone(), delay, Arc::clone(&cancel)));
                } else {
                    execution.errors.insert(task_id.clone(), reason.clone());
                    execution
                        .task_executions
                        .insert(task_id.clone(), task_execution.clone());
                    let skipped = graph.mark_failed(&task_id, task_execution);
                    error!(
                        execution_id = %exec_id,
                        task_id = %task_id,
                        attempts,
                        skipped = skipped.len(),
                        error = %reason,
                        "Workflow step failed permanently"
                    );
                    self.events.emit_quiet(
                        events::WORKFLOW_TASK_FAILED,
                        &json!({
                            "executionId": exec_id,
                            "taskId": task_id,
                            "error": reason,
                            "skipped": skipped,
                        }),
                    );
                }
            }

            self.record_progress(&mut execution, &graph);
        }

        self.finish(execution, graph, cancel.is_cancelled(), blocked)
    }

    fn wait_backoff<'a>(
        task_id: String,
        delay: Duration,
        cancel: Arc<CancelSignal>,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            let attempt = if cancel.sleep(delay).await {
                Attempt::Due
            } else {
                Attempt::Abandoned
            };
            StepOutcome { task_id, attempt }
        }
        .boxed()
    }

    fn run_step<'a>(
        &'a self,
        executor: &'a dyn TaskExecutor,
        task: TaskDefinition,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            let execution = match executor.execute_task(&task).await {
                Ok(execution) => execution,
                Err(e) => TaskExecution::rejected(&task.id, e.to_string(), self.clock.now()),
            };
            StepOutcome {
                task_id: task.id,
                attempt: Attempt::Finished(execution),
            }
        }
        .boxed()
    }

    fn record_progress(&self, execution: &mut WorkflowExecution, graph: &StepGraph) {
        execution.current_step = graph.terminal_count();
        execution.progress = progress_of(execution.current_step, execution.total_steps);
        execution.steps = graph.snapshot();
        if let Some(run) = self.active.lock().get_mut(&execution.id) {
            let status = run.execution.status;
            run.execution = execution.clone();
            run.execution.status = status;
        }
    }

    fn finish(
        &self,
        mut execution: WorkflowExecution,
        graph: StepGraph,
        cancelled: bool,
        blocked: Option<String>,
    ) -> ConvoyResult<WorkflowExecution> {
        execution.end_time = Some(self.clock.now());
        execution.current_step = graph.terminal_count();
        execution.progress = progress_of(execution.current_step, execution.total_steps);
        execution.steps = graph.snapshot();
        execution.status = if cancelled {
            execution.error = Some("workflow cancelled".to_string());
            WorkflowStatus::Cancelled
        } else if let Some(reason) = blocked {
            execution.error = Some(reason);
            WorkflowStatus::Failed
        } else if !execution.errors.is_empty() {
            let mut failed: Vec<&str> = execution.errors.keys().map(String::as_str).collect();
            failed.sort_unstable();
            execution.error = Some(format!("tasks failed: {}", failed.join(", ")));
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let duration_ms = execution.duration_ms().unwrap_or_default();
        {
            let mut counters = self.counters.lock();
            counters.total_duration_ms += duration_ms;
            match execution.status {
                WorkflowStatus::Completed => counters.completed += 1,
                WorkflowStatus::Failed => counters.failed += 1,
                WorkflowStatus::Cancelled => counters.cancelled += 1,
                WorkflowStatus::Running => {}
            }
        }
        let now_empty = {
            let mut active = self.active.lock();
            active.remove(&execution.id);
            active.is_empty()
        };
        self.history.lock().push(execution.clone());
        if now_empty {
            self.drained.notify_waiters();
        }

        let payload = serde_json::to_value(&execution).unwrap_or_default();
        match execution.status {
            WorkflowStatus::Completed => {
                info!(
                    execution_id = %execution.id,
                    workflow = %execution.workflow_id,
                    duration_ms,
                    "Workflow completed"
                );
                self.events.emit_quiet(events::WORKFLOW_COMPLETED, &payload);
            }
            WorkflowStatus::Failed => {
                error!(
                    execution_id = %execution.id,
                    workflow = %execution.workflow_id,
                    error = execution.error.as_deref().unwrap_or_default(),
                    "Workflow failed"
                );
                self.events.emit_quiet(events::WORKFLOW_FAILED, &payload);
            }
            WorkflowStatus::Cancelled => {
                info!(execution_id = %execution.id, "Workflow cancelled");
            }
            WorkflowStatus::Running => {}
        }
        Ok(execution)
    }

    /// Stop dispatching new steps of a running execution. Steps already
    /// executing run to completion. Retries waiting out a backoff are woken
    /// and abandoned.
    pub fn cancel_workflow(&self, execution_id: &str) -> bool {
        let workflow_id = {
            let mut active = self.active.lock();
            let Some(run) = active.get_mut(execution_id) else {
                return false;
            };
            if run.execution.status != WorkflowStatus::Running {
                return false;
            }
            run.cancel.cancel();
            run.execution.status = WorkflowStatus::Cancelled;
            run.execution.workflow_id.clone()
        };
        info!(execution_id = %execution_id, workflow = %workflow_id, "Workflow cancellation requested");
        self.events.emit_quiet(
            events::WORKFLOW_CANCELLED,
            &json!({ "executionId": execution_id, "workflowId": workflow_id }),
        );
        true
    }

    /// An active or retained execution.
    pub fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        if let Some(run) = self.active.lock().get(execution_id) {
            return Some(run.execution.clone());
        }
        self.history
            .lock()
            .iter()
            .rev()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    /// Runs in progress, oldest first.
    pub fn list_active_workflows(&self) -> Vec<WorkflowExecution> {
        let mut list: Vec<WorkflowExecution> = self
            .active
            .lock()
            .values()
            .map(|r| r.execution.clone())
            .collect();
        list.sort_by_key(|e| e.start_time);
        list
    }

    /// Finished executions, newest `limit`, oldest first.
    pub fn get_workflow_history(&self, limit: usize) -> Vec<WorkflowExecution> {
        self.history.lock().recent(limit)
    }

    /// Counters over all runs.
    pub fn get_workflow_stats(&self) -> WorkflowStats {
        let counters = self.counters.lock();
        let finished = counters.completed + counters.failed + counters.cancelled;
        WorkflowStats {
            active: self.active.lock().len(),
            started: counters.started,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retained: self.history.lock().len(),
            average_duration_ms: if finished == 0 {
                0.0
            } else {
                counters.total_duration_ms as f64 / finished as f64
            },
        }
    }

    /// Accept new executions again after a [`stop`](Self::stop).
    pub fn start(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        info!("Workflow engine started");
    }

    /// Refuse new executions, cancel the active ones and wait until they
    /// have all returned.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();
        for id in &ids {
            self.cancel_workflow(id);
        }
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.active.lock().is_empty() {
                break;
            }
            drained.await;
        }
        info!(cancelled = ids.len(), "Workflow engine stopped");
    }
}

fn progress_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Add every `params` key missing from an object `config`. A null config
/// becomes a copy of `params`.
fn merge_params(config: &mut Payload, params: &Payload) {
    let Some(params) = params.as_object() else {
        return;
    };
    match config {
        Payload::Null => *config = Payload::Object(params.clone()),
        Payload::Object(map) => {
            for (key, value) in params {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;
    use crate::steps::StepStatus;
    use std::collections::HashMap as Map;
    use std::sync::atomic::AtomicU32;

    /// Records call order and fails the first `fail_first[id]` attempts of a task.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
        fail_first: Map<String, u32>,
        attempts: Mutex<Map<String, u32>>,
        seen_config: Mutex<Map<String, Payload>>,
    }

    impl ScriptedExecutor {
        fn failing(id: &str, times: u32) -> Self {
            Self {
                fail_first: Map::from([(id.to_string(), times)]),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute_task(&self, def: &TaskDefinition) -> ConvoyResult<TaskExecution> {
            self.calls.lock().push(def.id.clone());
            self.seen_config.lock().insert(def.id.clone(), def.config.clone());
            let n = {
                let mut attempts = self.attempts.lock();
                let n = attempts.entry(def.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            tokio::task::yield_now().await;
            if n <= self.fail_first.get(&def.id).copied().unwrap_or(0) {
                return Err(ConvoyError::Execution(format!("{} attempt {n} failed", def.id)));
            }
            let mut exec = TaskExecution::started(&def.id, Some("agent".into()), Utc::now());
            exec.complete(json!({ "task": def.id }), Utc::now());
            Ok(exec)
        }
    }

    fn task(id: &str) -> TaskDefinition {
        TaskDefinition::new(id, id, "worker")
    }

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "chain", vec![task("C"), task("A"), task("B")])
            .with_dependency("B", ["A"])
            .with_dependency("C", ["B"])
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let engine = WorkflowEngine::new(10);
        let exec = ScriptedExecutor::default();
        let result = engine.execute_workflow(&chain(), &exec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(*exec.calls.lock(), vec!["A", "B", "C"]);
        assert_eq!(result.progress, 100.0);
        assert_eq!(result.current_step, 3);
        assert_eq!(result.results["B"], json!({ "task": "B" }));
        assert!(result.end_time.is_some());
    }

    #[tokio::test]
    async fn test_cycle_fails_fast() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new("wf", "cycle", vec![task("A"), task("B")])
            .with_dependency("A", ["B"])
            .with_dependency("B", ["A"]);
        let exec = ScriptedExecutor::default();
        let result = engine.execute_workflow(&def, &exec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("blocked"), "{error}");
        assert!(error.contains("A, B"), "{error}");
        assert!(error.contains("cycle"), "{error}");
        assert!(exec.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_blocked() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new(
            "wf",
            "ghost",
            vec![task("A").with_dependencies(["ghost"])],
        );
        let result = engine
            .execute_workflow(&def, &ScriptedExecutor::default(), None)
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("unknown dependencies: ghost"));
    }

    #[tokio::test]
    async fn test_independent_steps_overlap() {
        struct Gate {
            running: AtomicU32,
            peak: AtomicU32,
        }
        #[async_trait]
        impl TaskExecutor for Gate {
            async fn execute_task(&self, def: &TaskDefinition) -> ConvoyResult<TaskExecution> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                let mut e = TaskExecution::started(&def.id, None, Utc::now());
                e.complete(Payload::Null, Utc::now());
                Ok(e)
            }
        }
        let gate = Gate {
            running: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        };
        let def = WorkflowDefinition::new("wf", "fan", vec![task("a"), task("b"), task("c")]);
        let engine = WorkflowEngine::new(10);
        let result = engine.execute_workflow(&def, &gate, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(gate.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let engine = WorkflowEngine::new(10);
        let def = chain().with_retry_policy(RetryPolicy {
            max_retries: 2,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: 500,
        });
        let exec = ScriptedExecutor::failing("B", 2);
        let started = tokio::time::Instant::now();
        let result = engine.execute_workflow(&def, &exec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(*exec.calls.lock(), vec!["A", "B", "B", "B", "C"]);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        let b = result.steps.iter().find(|s| s.task_id == "B").unwrap();
        assert_eq!(b.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_dependents() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new("wf", "partial", vec![task("A"), task("B"), task("C"), task("D")])
            .with_dependency("B", ["A"])
            .with_dependency("C", ["B"])
            .with_retry_policy(RetryPolicy {
                max_retries: 1,
                backoff_strategy: BackoffStrategy::Exponential,
                base_delay_ms: 100,
            });
        let exec = ScriptedExecutor::failing("A", 10);
        let result = engine.execute_workflow(&def, &exec, None).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.errors["A"].contains("attempt 2 failed"));
        let status = |id: &str| result.steps.iter().find(|s| s.task_id == id).unwrap().status;
        assert_eq!(status("A"), StepStatus::Failed);
        assert_eq!(status("B"), StepStatus::Skipped);
        assert_eq!(status("C"), StepStatus::Skipped);
        assert_eq!(status("D"), StepStatus::Completed);
        assert_eq!(result.progress, 100.0);
        assert_eq!(exec.calls.lock().iter().filter(|c| *c == "A").count(), 2);
    }

    #[tokio::test]
    async fn test_params_merged_without_override() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new(
            "wf",
            "params",
            vec![task("A").with_config(json!({ "mode": "fast" })), task("B")],
        );
        let exec = ScriptedExecutor::default();
        engine
            .execute_workflow(&def, &exec, Some(json!({ "mode": "slow", "user": "ops" })))
            .await
            .unwrap();
        let seen = exec.seen_config.lock();
        assert_eq!(seen["A"], json!({ "mode": "fast", "user": "ops" }));
        assert_eq!(seen["B"], json!({ "mode": "slow", "user": "ops" }));
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new("wf", "dup", vec![task("A"), task("A")]);
        let err = engine
            .execute_workflow(&def, &ScriptedExecutor::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let engine = WorkflowEngine::new(10);
        let def = WorkflowDefinition::new("wf", "empty", vec![]);
        let result = engine
            .execute_workflow(&def, &ScriptedExecutor::default(), None)
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.progress, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_dispatch() {
        let engine = Arc::new(WorkflowEngine::new(10));
        let exec = Arc::new(ScriptedExecutor::failing("A", 1));
        let def = chain().with_retry_policy(RetryPolicy {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: 10_000,
        });

        let handle = {
            let engine = Arc::clone(&engine);
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { engine.execute_workflow(&def, exec.as_ref(), None).await })
        };
        // Let A fail once and enter its backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let active = engine.list_active_workflows();
        assert_eq!(active.len(), 1);
        assert!(engine.cancel_workflow(&active[0].id));
        assert!(!engine.cancel_workflow(&active[0].id));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(*exec.calls.lock(), vec!["A"]);
        assert!(engine.list_active_workflows().is_empty());
        assert_eq!(engine.get_workflow_stats().cancelled, 1);
        assert_eq!(engine.get_execution(&result.id).unwrap().status, WorkflowStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_retry_backoff() {
        let engine = Arc::new(WorkflowEngine::new(10));
        let exec = Arc::new(ScriptedExecutor::failing("A", 1));
        let def = chain().with_retry_policy(RetryPolicy {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: 30_000,
        });

        let handle = {
            let engine = Arc::clone(&engine);
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { engine.execute_workflow(&def, exec.as_ref(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.list_active_workflows().len(), 1);

        let started = tokio::time::Instant::now();
        engine.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(*exec.calls.lock(), vec!["A"]);
        let a = result.steps.iter().find(|s| s.task_id == "A").unwrap();
        assert_eq!(a.status, StepStatus::Failed);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attempt_shows_running() {
        /// Fails the first attempt and records how the engine reports the
        /// step while each attempt is executing.
        struct Watcher {
            engine: Arc<WorkflowEngine>,
            calls: AtomicU32,
            seen: Mutex<Vec<(StepStatus, u32)>>,
        }
        #[async_trait]
        impl TaskExecutor for Watcher {
            async fn execute_task(&self, def: &TaskDefinition) -> ConvoyResult<TaskExecution> {
                let active = self.engine.list_active_workflows();
                let step = active[0].steps.iter().find(|s| s.task_id == def.id).unwrap();
                self.seen.lock().push((step.status, step.attempts));
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ConvoyError::Execution("first attempt".into()));
                }
                let mut e = TaskExecution::started(&def.id, None, Utc::now());
                e.complete(Payload::Null, Utc::now());
                Ok(e)
            }
        }

        let engine = Arc::new(WorkflowEngine::new(10));
        let watcher = Arc::new(Watcher {
            engine: Arc::clone(&engine),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let def = WorkflowDefinition::new("wf", "single", vec![task("A")]).with_retry_policy(
            RetryPolicy {
                max_retries: 1,
                backoff_strategy: BackoffStrategy::Fixed,
                base_delay_ms: 1_000,
            },
        );

        let handle = {
            let engine = Arc::clone(&engine);
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { engine.execute_workflow(&def, watcher.as_ref(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let waiting = engine.list_active_workflows();
        assert_eq!(waiting[0].steps[0].status, StepStatus::Pending);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(
            *watcher.seen.lock(),
            vec![(StepStatus::Running, 1), (StepStatus::Running, 2)]
        );
    }

    #[tokio::test]
    async fn test_stats_and_history() {
        let engine = WorkflowEngine::new(1);
        let exec = ScriptedExecutor::default();
        let first = engine.execute_workflow(&chain(), &exec, None).await.unwrap();
        let second = engine.execute_workflow(&chain(), &exec, None).await.unwrap();
        let stats = engine.get_workflow_stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.retained, 1);
        assert!(engine.get_execution(&first.id).is_none());
        assert!(engine.get_execution(&second.id).is_some());
        assert!(!engine.cancel_workflow(&second.id));
    }

    #[tokio::test]
    async fn test_stop_rejects_new_executions() {
        let engine = WorkflowEngine::new(10);
        engine.stop().await;
        assert!(engine
            .execute_workflow(&chain(), &ScriptedExecutor::default(), None)
            .await
            .is_err());
        engine.start();
        assert!(engine
            .execute_workflow(&chain(), &ScriptedExecutor::default(), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let engine = WorkflowEngine::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in [
            events::WORKFLOW_STARTED,
            events::WORKFLOW_TASK_COMPLETED,
            events::WORKFLOW_COMPLETED,
        ] {
            let seen = Arc::clone(&seen);
            engine.on(name, move |_| {
                seen.lock().push(name);
                Ok(())
            });
        }
        engine
            .execute_workflow(&chain(), &ScriptedExecutor::default(), None)
            .await
            .unwrap();
        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&events::WORKFLOW_STARTED));
        assert_eq!(seen.last(), Some(&events::WORKFLOW_COMPLETED));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_load_definition_from_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("wf.json");
        std::fs::write(
            &json_path,
            r#"{"id": "j", "name": "J",
                "tasks": [{"id": "a", "name": "a", "agentType": "w"},
                          {"id": "b", "name": "b", "agentType": "w"}],
                "dependencies": {"b": ["a"]},
                "retryPolicy": {"maxRetries": 1, "backoffStrategy": "fixed"}}"#,
        )
        .unwrap();
        let def = WorkflowDefinition::load(&json_path).unwrap();
        assert_eq!(def.dependencies["b"], vec!["a".to_string()]);
        assert_eq!(def.retry_policy.max_retries, 1);
        assert_eq!(def.retry_policy.backoff_strategy, BackoffStrategy::Fixed);

        let toml_path = dir.path().join("wf.toml");
        std::fs::write(
            &toml_path,
            "id = \"t\"\nname = \"T\"\n\n[[tasks]]\nid = \"a\"\nname = \"a\"\nagentType = \"w\"\npriority = \"high\"\n",
        )
        .unwrap();
        let def = WorkflowDefinition::load(&toml_path).unwrap();
        assert_eq!(def.tasks.len(), 1);
        assert_eq!(def.retry_policy, RetryPolicy::default());

        std::fs::write(&toml_path, "id = \"t\"\nname = \"T\"\ntasks = []\n\n[dependencies]\nghost = [\"a\"]\n").unwrap();
        assert!(WorkflowDefinition::load(&toml_path).is_err());
    }
}

