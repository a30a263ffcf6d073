use crate::agent::{Agent, AgentRegistry};
use crate::config::ConvoyConfig;
use crate::health::{HealthMonitor, HealthStats, HealthThresholdsUpdate};
use crate::probe::{SysinfoProbe, SystemProbe};
use crate::scheduler::{FailureOutcome, SchedulerStats, TaskDispatcher, TaskScheduler};
use crate::types::{AgentSnapshot, AgentStatus, ScheduledTask, TaskDefinition, TaskExecution};
use crate::workflow::{TaskExecutor, WorkflowDefinition, WorkflowEngine, WorkflowExecution, WorkflowStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_bus::{MessageBus, MessageStats, OutgoingMessage};
use convoy_core::{Clock, ConvoyResult, EventEmitter, Payload, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bus address of the coordinator itself.
pub const COORDINATOR_ID: &str = "coordinator";

/// Coordinator event names.
pub mod events {
    /// An agent was registered and subscribed on the bus.
    pub const AGENT_REGISTERED: &str = "agent_registered";
    /// An agent was removed.
    pub const AGENT_UNREGISTERED: &str = "agent_unregistered";
    /// An attempt ran on an agent, successfully or not.
    pub const TASK_EXECUTED: &str = "task_executed";
    /// No agent could take the task.
    pub const TASK_REJECTED: &str = "task_rejected";
}

/// Bus message types sent to agents around each attempt.
pub mod messages {
    /// Sent to an agent before its attempt starts.
    pub const TASK_ASSIGNED: &str = "task_assigned";
    /// Sent to an agent with the outcome of its attempt.
    pub const TASK_RESULT: &str = "task_result";
}

/// Aggregate view over every registered agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    /// When the metrics were taken.
    pub timestamp: DateTime<Utc>,
    /// Time since `start`; 0 when never started.
    pub uptime_ms: u64,
    /// Registered agents.
    pub total_agents: usize,
    /// Agents with no active task.
    pub idle_agents: usize,
    /// Agents with at least one active task.
    pub busy_agents: usize,
    /// Agents taken out of selection after repeated failures.
    pub failed_agents: usize,
    /// Attempts across all agents.
    pub total_executions: u64,
    /// Successful attempts across all agents.
    pub successful_executions: u64,
    /// Failed attempts across all agents.
    pub failed_executions: u64,
    /// Percent of executions that succeeded; 100 when nothing ran yet.
    pub success_rate: f64,
    /// Mean attempt duration, weighted by each agent's execution count.
    pub average_execution_time_ms: f64,
    /// Health score of the monitor, 0-100.
    pub system_health: f64,
}

/// Everything `convoy status` prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    /// Whether `start` was called without a later `stop`.
    pub is_running: bool,
    /// Time of the last `start`.
    pub started_at: Option<DateTime<Utc>>,
    /// Agent aggregates.
    pub metrics: SystemMetrics,
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Bus counters.
    pub messages: MessageStats,
    /// Workflow counters.
    pub workflows: WorkflowStats,
    /// Monitor counters.
    pub health: HealthStats,
}

/// Wires the bus, scheduler, workflow engine, health monitor and agent
/// registry together and turns task definitions into agent executions.
pub struct Coordinator {
    config: RwLock<ConvoyConfig>,
    clock: Arc<dyn Clock>,
    bus: MessageBus,
    scheduler: Arc<TaskScheduler>,
    workflows: WorkflowEngine,
    monitor: Arc<HealthMonitor>,
    registry: Arc<AgentRegistry>,
    events: EventEmitter<Payload>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Coordinator {
    /// A coordinator sampling the host with `sysinfo`.
    pub fn new(config: ConvoyConfig) -> ConvoyResult<Self> {
        let probe = SysinfoProbe::new(
            config.monitor.connectivity_target.clone(),
            Duration::from_millis(config.monitor.connectivity_timeout_ms),
        );
        Self::with_parts(config, SystemClock::shared(), Arc::new(probe))
    }

    /// Build with an explicit clock and host probe.
    pub fn with_parts(
        config: ConvoyConfig,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn SystemProbe>,
    ) -> ConvoyResult<Self> {
        config.validate()?;
        let bus = MessageBus::with_clock(config.bus.clone(), Arc::clone(&clock));
        let scheduler = Arc::new(TaskScheduler::with_clock(&config.scheduler, Arc::clone(&clock)));
        let workflows = WorkflowEngine::with_clock(config.workflow.history_limit, Arc::clone(&clock));
        let monitor = Arc::new(HealthMonitor::with_parts(&config.monitor, Arc::clone(&clock), probe));
        let registry = Arc::new(AgentRegistry::new());
        monitor.set_agent_source(registry.clone());

        Ok(Self {
            config: RwLock::new(config),
            clock,
            bus,
            scheduler,
            workflows,
            monitor,
            registry,
            events: EventEmitter::new(),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    /// Register a handler for a coordinator event. See [`events`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Payload) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    // --- Agents ---

    /// Register an agent and subscribe it to every message type on the bus.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> ConvoyResult<()> {
        let id = agent.id().to_string();
        self.registry.register(agent, self.clock.now())?;
        self.bus.subscribe(id.clone(), std::iter::empty::<String>());
        self.events
            .emit_quiet(events::AGENT_REGISTERED, &json!({ "agentId": id }));
        Ok(())
    }

    /// Remove an agent and its bus subscription.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        if !self.registry.unregister(agent_id) {
            return false;
        }
        self.bus.unsubscribe(agent_id, std::iter::empty::<String>());
        self.events
            .emit_quiet(events::AGENT_UNREGISTERED, &json!({ "agentId": agent_id }));
        true
    }

    /// Clear a failed or recovering agent back to idle.
    pub fn reset_agent(&self, agent_id: &str) -> bool {
        self.registry.reset(agent_id)
    }

    // --- Execution ---

    /// Run one attempt of `definition` on a matching agent.
    ///
    /// Never fails: an unresolvable agent or a failing agent both produce a
    /// failed [`TaskExecution`]. Every attempt on an agent is followed by an
    /// agent health check.
    pub async fn execute_task(&self, definition: &TaskDefinition) -> TaskExecution {
        let agent = match self.registry.resolve(definition) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(task_id = %definition.id, agent_type = %definition.agent_type, error = %e, "Task rejected");
                self.events.emit_quiet(
                    events::TASK_REJECTED,
                    &json!({ "taskId": definition.id, "error": e.to_string() }),
                );
                return TaskExecution::rejected(&definition.id, e.to_string(), self.clock.now());
            }
        };
        let agent_id = agent.id().to_string();

        self.registry.mark_busy(&agent_id, &definition.id);
        let mut execution =
            TaskExecution::started(&definition.id, Some(agent_id.clone()), self.clock.now());
        self.bus.send(OutgoingMessage::new(
            COORDINATOR_ID,
            agent_id.clone(),
            messages::TASK_ASSIGNED,
            json!({ "taskId": definition.id, "executionId": execution.id }),
        ));
        debug!(task_id = %definition.id, agent_id = %agent_id, "Executing task");

        let outcome = agent.execute(definition).await;
        let now = self.clock.now();
        let failure_limit = self.config.read().monitor.thresholds.agent_failures;

        let snapshot = match outcome {
            Ok(result) => {
                execution.complete(result, now);
                let duration = execution.duration_ms.unwrap_or_default();
                self.registry.record_success(&agent_id, duration, now)
            }
            Err(e) => {
                execution.fail(e.to_string(), now);
                let duration = execution.duration_ms.unwrap_or_default();
                warn!(task_id = %definition.id, agent_id = %agent_id, error = %e, "Task execution failed");
                self.registry
                    .record_failure(&agent_id, duration, &e.to_string(), failure_limit, now)
            }
        };
        if let Some(snapshot) = snapshot {
            self.monitor.perform_agent_health_check(&agent_id, &snapshot);
        }

        let payload = serde_json::to_value(&execution).unwrap_or_default();
        self.bus.send(OutgoingMessage::new(
            COORDINATOR_ID,
            agent_id,
            messages::TASK_RESULT,
            payload.clone(),
        ));
        self.events.emit_quiet(events::TASK_EXECUTED, &payload);
        execution
    }

    /// Run a scheduled task and report the outcome back to the scheduler.
    /// Returns whether the attempt succeeded.
    pub async fn run_scheduled(&self, task: ScheduledTask) -> bool {
        let execution = self.execute_task(&task.definition).await;
        if execution.is_success() {
            self.scheduler.mark_task_as_completed(&task.id, execution)
        } else {
            if let FailureOutcome::Retrying { attempt, delay } =
                self.scheduler.mark_task_as_failed(&task.id, execution)
            {
                debug!(task_id = %task.id, attempt, delay_ms = delay.as_millis() as u64, "Scheduled task will retry");
            }
            false
        }
    }

    /// Queue `definition` with the scheduler after `delay`. Returns the scheduled id.
    pub fn schedule_task(&self, definition: TaskDefinition, delay: Duration) -> String {
        self.scheduler.schedule_task(definition, delay)
    }

    /// Run a workflow with this coordinator as the executor.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        params: Option<Payload>,
    ) -> ConvoyResult<WorkflowExecution> {
        self.workflows.execute_workflow(definition, self, params).await
    }

    /// Apply the hot-reloadable parts of `config`: thresholds and concurrency.
    pub fn apply_config(&self, config: &ConvoyConfig) -> ConvoyResult<()> {
        config.validate()?;
        self.monitor
            .set_thresholds(HealthThresholdsUpdate::from(&config.monitor.thresholds))?;
        self.scheduler
            .set_max_concurrent_tasks(config.scheduler.max_concurrent_tasks);
        *self.config.write() = config.clone();
        info!("Configuration applied");
        Ok(())
    }

    // --- Lifecycle ---

    /// Whether the coordinator has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start bus, scheduler, health monitor and workflow engine, in that order.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock() = Some(self.clock.now());
        for id in self.registry.ids() {
            self.registry.bring_online(&id);
        }
        self.bus.start();
        self.scheduler.start(Arc::new(Dispatcher(Arc::downgrade(self))));
        self.monitor.start();
        self.workflows.start();
        info!(agents = self.registry.len(), "Coordinator started");
    }

    /// Stop in reverse order. Active workflows are cancelled and awaited,
    /// queued bus messages are drained. Every agent is left offline until
    /// the next [`start`](Self::start).
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.workflows.stop().await;
        self.monitor.stop();
        self.scheduler.stop();
        self.bus.stop().await;
        for id in self.registry.ids() {
            self.registry.set_offline(&id);
        }
        info!("Coordinator stopped");
    }

    // --- Views ---

    /// Snapshots of every agent, sorted by id.
    pub fn get_agents_status(&self) -> Vec<AgentSnapshot> {
        self.registry.snapshots()
    }

    /// Aggregate agent metrics.
    pub fn get_system_metrics(&self) -> SystemMetrics {
        let now = self.clock.now();
        let agents = self.registry.snapshots();
        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();

        let (total, ok, failed, time_sum) = agents.iter().fold((0u64, 0u64, 0u64, 0f64), |acc, a| {
            let m = &a.metrics;
            (
                acc.0 + m.total_executions,
                acc.1 + m.successful_executions,
                acc.2 + m.failed_executions,
                acc.3 + m.average_execution_time_ms * m.total_executions as f64,
            )
        });
        let started_at = *self.started_at.lock();
        let uptime_ms = started_at
            .filter(|_| self.is_running())
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or_default();

        SystemMetrics {
            timestamp: now,
            uptime_ms,
            total_agents: agents.len(),
            idle_agents: count(AgentStatus::Idle),
            busy_agents: count(AgentStatus::Busy),
            failed_agents: count(AgentStatus::Failed),
            total_executions: total,
            successful_executions: ok,
            failed_executions: failed,
            success_rate: if total == 0 {
                100.0
            } else {
                ok as f64 * 100.0 / total as f64
            },
            average_execution_time_ms: if total == 0 { 0.0 } else { time_sum / total as f64 },
            system_health: self.monitor.get_system_health(),
        }
    }

    /// Full status, as reported by the CLI.
    pub fn get_status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            is_running: self.is_running(),
            started_at: *self.started_at.lock(),
            metrics: self.get_system_metrics(),
            scheduler: self.scheduler.get_scheduler_stats(),
            messages: self.bus.get_message_stats(),
            workflows: self.workflows.get_workflow_stats(),
            health: self.monitor.get_health_stats(),
        }
    }

    /// The message bus.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The workflow engine.
    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    /// The health monitor.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// A copy of the active configuration.
    pub fn config(&self) -> ConvoyConfig {
        self.config.read().clone()
    }
}

#[async_trait]
impl TaskExecutor for Coordinator {
    async fn execute_task(&self, definition: &TaskDefinition) -> ConvoyResult<TaskExecution> {
        Ok(Coordinator::execute_task(self, definition).await)
    }
}

/// Scheduler-side handle that does not keep the coordinator alive.
struct Dispatcher(Weak<Coordinator>);

#[async_trait]
impl TaskDispatcher for Dispatcher {
    async fn dispatch(&self, task: ScheduledTask) {
        match self.0.upgrade() {
            Some(coordinator) => {
                coordinator.run_scheduled(task).await;
            }
            None => debug!(task_id = %task.id, "Coordinator dropped, task discarded"),
        }
    }
}
