use chrono::{DateTime, Utc};
use convoy_core::{generate_id, Payload};
use serde::{Deserialize, Serialize};

/// Symbolic priority of a task definition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Weight 1.
    Low,
    /// Weight 2; the default.
    #[default]
    Medium,
    /// Weight 3.
    High,
    /// Weight 4, with a larger retry budget.
    Critical,
}

impl TaskPriority {
    /// Numeric weight used for ordering: critical=4, high=3, medium=2, low=1.
    pub fn weight(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }

    /// Retry budget granted by the scheduler.
    pub fn max_retries(self) -> u32 {
        match self {
            TaskPriority::Critical => 5,
            _ => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Static description of a unit of work. Never mutated by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique id within a workflow.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Type of agent that may run this task.
    pub agent_type: String,
    /// Admission priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Prerequisite task ids inside a workflow.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capabilities the chosen agent must offer.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Opaque input handed to the agent.
    #[serde(default)]
    pub config: Payload,
    /// Carried for callers; not enforced by the scheduler or workflow engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TaskDefinition {
    /// A medium-priority task with no dependencies.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            config: Payload::Null,
            timeout_ms: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the prerequisite ids.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the required capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the agent input.
    pub fn with_config(mut self, config: Payload) -> Self {
        self.config = config;
        self
    }
}

/// Status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not started.
    Pending,
    /// Running on an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Removed before it ran.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Runtime record of one attempt at running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    /// Unique execution id.
    pub id: String,
    /// Id of the task definition.
    pub task_id: String,
    /// Agent that ran the attempt; `None` when no agent was found.
    pub agent_id: Option<String>,
    /// Current status.
    pub status: TaskStatus,
    /// When the attempt started.
    pub start_time: DateTime<Utc>,
    /// Set once terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Set once terminal.
    pub duration_ms: Option<u64>,
    /// Agent output on success.
    pub result: Option<Payload>,
    /// Failure reason.
    pub error: Option<String>,
    /// Retries that preceded this attempt.
    pub retries: u32,
    /// Percent complete, 0-100.
    pub progress: f64,
}

impl TaskExecution {
    /// A running execution of `task_id` on `agent_id`.
    pub fn started(task_id: impl Into<String>, agent_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id("exec"),
            task_id: task_id.into(),
            agent_id,
            status: TaskStatus::Running,
            start_time: now,
            end_time: None,
            duration_ms: None,
            result: None,
            error: None,
            retries: 0,
            progress: 0.0,
        }
    }

    /// An execution that failed before reaching any agent.
    pub fn rejected(task_id: impl Into<String>, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut execution = Self::started(task_id, None, now);
        execution.fail(error, now);
        execution
    }

    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds().max(0) as u64);
    }

    /// Finish successfully with `result`.
    pub fn complete(&mut self, result: Payload, now: DateTime<Utc>) {
        self.result = Some(result);
        self.progress = 100.0;
        self.finish(TaskStatus::Completed, now);
    }

    /// Finish with an error.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.error = Some(error.into());
        self.finish(TaskStatus::Failed, now);
    }

    /// Finish as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.finish(TaskStatus::Cancelled, now);
    }

    /// Whether the attempt completed.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Coarse ordering partition of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBucket {
    /// Weights 3 and 4.
    High,
    /// Weight 2.
    Normal,
    /// Weight 1.
    Low,
}

impl PriorityBucket {
    /// high for weights >= 3, normal for 2, low otherwise.
    pub fn for_weight(weight: u8) -> Self {
        if weight >= 3 {
            PriorityBucket::High
        } else if weight >= 2 {
            PriorityBucket::Normal
        } else {
            PriorityBucket::Low
        }
    }
}

/// A task admitted to the scheduler, waiting in exactly one priority bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Scheduler-assigned id, distinct from the definition id.
    pub id: String,
    /// The task to run.
    pub definition: TaskDefinition,
    /// Earliest dispatch time.
    pub scheduled_time: DateTime<Utc>,
    /// Numeric priority weight.
    pub priority: u8,
    /// Failed runs so far.
    pub retries: u32,
    /// Failed runs allowed before giving up.
    pub max_retries: u32,
    /// Set when the task was produced by a recurring schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_id: Option<String>,
}

impl ScheduledTask {
    /// Bucket derived from the priority weight.
    pub fn bucket(&self) -> PriorityBucket {
        PriorityBucket::for_weight(self.priority)
    }
}

// --- Agents ---

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered with no active task.
    #[default]
    Idle,
    /// Running at least one task.
    Busy,
    /// Failed recently but still selectable.
    Recovering,
    /// Reached the consecutive failure limit; needs a reset.
    Failed,
    /// Taken out of selection while the coordinator is stopped.
    Offline,
}

impl AgentStatus {
    /// Whether the registry may hand new work to an agent in this status.
    pub fn accepts_work(self) -> bool {
        !matches!(self, AgentStatus::Failed | AgentStatus::Offline)
    }
}

/// Self-reported and derived health of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    /// Cleared after the failure limit is reached.
    pub is_healthy: bool,
    /// Time of the latest attempt.
    pub last_check: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Recent failure messages, oldest first.
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check: None,
            consecutive_failures: 0,
            issues: Vec::new(),
        }
    }
}

/// Execution counters and resource usage of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    /// Attempts recorded.
    pub total_executions: u64,
    /// Successful attempts.
    pub successful_executions: u64,
    /// Failed attempts.
    pub failed_executions: u64,
    /// Mean attempt duration.
    pub average_execution_time_ms: f64,
    /// Duration of the latest attempt.
    pub last_execution_time_ms: u64,
    /// Percent of memory attributed to the agent.
    pub memory_usage: f64,
    /// Percent of CPU attributed to the agent.
    pub cpu_usage: f64,
}

impl AgentMetrics {
    /// Failed executions as a percentage of all executions.
    pub fn error_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.failed_executions as f64 * 100.0 / self.total_executions as f64
        }
    }
}

/// Resource usage reported by an agent implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Percent of memory in use.
    pub memory_usage: f64,
    /// Percent of CPU in use.
    pub cpu_usage: f64,
}

/// Read-only snapshot of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    /// Agent id.
    pub id: String,
    /// Agent type.
    pub agent_type: String,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Health flags and recent issues.
    pub health: AgentHealth,
    /// Execution counters.
    pub metrics: AgentMetrics,
    /// Attempts currently running.
    pub active_tasks: u32,
    /// Task of the latest running attempt.
    pub current_task: Option<String>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_weights() {
        assert_eq!(TaskPriority::Critical.weight(), 4);
        assert_eq!(TaskPriority::High.weight(), 3);
        assert_eq!(TaskPriority::Medium.weight(), 2);
        assert_eq!(TaskPriority::Low.weight(), 1);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn test_max_retries_by_priority() {
        assert_eq!(TaskPriority::Critical.max_retries(), 5);
        assert_eq!(TaskPriority::High.max_retries(), 3);
        assert_eq!(TaskPriority::Low.max_retries(), 3);
    }

    #[test]
    fn test_bucket_for_weight() {
        assert_eq!(PriorityBucket::for_weight(4), PriorityBucket::High);
        assert_eq!(PriorityBucket::for_weight(3), PriorityBucket::High);
        assert_eq!(PriorityBucket::for_weight(2), PriorityBucket::Normal);
        assert_eq!(PriorityBucket::for_weight(1), PriorityBucket::Low);
    }

    #[test]
    fn test_definition_defaults_from_json() {
        let def: TaskDefinition = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "name": "check files",
            "agentType": "file-checker"
        }))
        .unwrap();
        assert_eq!(def.priority, TaskPriority::Medium);
        assert!(def.dependencies.is_empty());
        assert!(def.config.is_null());
        assert!(def.timeout_ms.is_none());
    }

    #[test]
    fn test_execution_lifecycle() {
        let start = Utc::now();
        let mut exec = TaskExecution::started("t1", Some("agent-1".into()), start);
        assert_eq!(exec.status, TaskStatus::Running);
        exec.complete(serde_json::json!({"files": 3}), start + chrono::Duration::milliseconds(250));
        assert!(exec.is_success());
        assert_eq!(exec.duration_ms, Some(250));
        assert_eq!(exec.progress, 100.0);
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn test_rejected_execution() {
        let exec = TaskExecution::rejected("t1", "no agent", Utc::now());
        assert_eq!(exec.status, TaskStatus::Failed);
        assert!(exec.agent_id.is_none());
        assert_eq!(exec.error.as_deref(), Some("no agent"));
    }

    #[test]
    fn test_error_rate() {
        let metrics = AgentMetrics {
            total_executions: 20,
            failed_executions: 5,
            ..AgentMetrics::default()
        };
        assert_eq!(metrics.error_rate(), 25.0);
        assert_eq!(AgentMetrics::default().error_rate(), 0.0);
    }

    #[test]
    fn test_agent_status_accepts_work() {
        assert!(AgentStatus::Idle.accepts_work());
        assert!(AgentStatus::Recovering.accepts_work());
        assert!(!AgentStatus::Failed.accepts_work());
        assert!(!AgentStatus::Offline.accepts_work());
    }
}
