use crate::health::AgentHealthSource;
use crate::types::{
    AgentHealth, AgentMetrics, AgentSnapshot, AgentStatus, ResourceUsage, TaskDefinition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult, Payload};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Most recent failure messages kept per agent.
const MAX_ISSUES: usize = 10;

/// A unit of work registered with the coordinator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique id; also the agent's bus address.
    fn id(&self) -> &str;

    /// Type name that task definitions select on.
    fn agent_type(&self) -> &str;

    /// Capabilities a task may require. None by default.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Current resource usage, sampled after each attempt.
    fn resource_usage(&self) -> ResourceUsage {
        ResourceUsage::default()
    }

    /// Run one attempt of `task`. Called at most once per attempt.
    async fn execute(&self, task: &TaskDefinition) -> ConvoyResult<Payload>;
}

struct Registered {
    agent: Arc<dyn Agent>,
    snapshot: AgentSnapshot,
}

/// Tracks registered agents with their status, health and metrics.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Registered>>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Add `agent`. Fails if its id is already registered.
    pub fn register(&self, agent: Arc<dyn Agent>, now: DateTime<Utc>) -> ConvoyResult<()> {
        let id = agent.id().to_string();
        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(ConvoyError::Agent(format!("agent '{id}' is already registered")));
        }
        let usage = agent.resource_usage();
        let snapshot = AgentSnapshot {
            id: id.clone(),
            agent_type: agent.agent_type().to_string(),
            capabilities: agent.capabilities(),
            status: AgentStatus::Idle,
            health: AgentHealth::default(),
            metrics: AgentMetrics {
                memory_usage: usage.memory_usage,
                cpu_usage: usage.cpu_usage,
                ..AgentMetrics::default()
            },
            active_tasks: 0,
            current_task: None,
            registered_at: now,
        };
        info!(agent_id = %id, agent_type = %snapshot.agent_type, "Agent registered");
        agents.insert(id, Registered { agent, snapshot });
        Ok(())
    }

    /// Remove an agent. Returns `false` for unknown ids.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.agents.write().remove(id).is_some();
        if removed {
            info!(agent_id = %id, "Agent unregistered");
        }
        removed
    }

    /// Pick an agent for `task`: matching type, not failed or offline, and
    /// offering every required capability. Idle agents win, then the one
    /// with the fewest active tasks.
    pub fn resolve(&self, task: &TaskDefinition) -> ConvoyResult<Arc<dyn Agent>> {
        let agents = self.agents.read();
        let mut of_type = agents
            .values()
            .filter(|r| r.snapshot.agent_type == task.agent_type)
            .peekable();
        if of_type.peek().is_none() {
            return Err(ConvoyError::NotFound(format!(
                "no agent registered for type '{}'",
                task.agent_type
            )));
        }
        of_type
            .filter(|r| r.snapshot.status.accepts_work())
            .filter(|r| {
                task.required_capabilities
                    .iter()
                    .all(|cap| r.snapshot.capabilities.contains(cap))
            })
            .min_by_key(|r| {
                (
                    r.snapshot.status != AgentStatus::Idle,
                    r.snapshot.active_tasks,
                    r.snapshot.id.clone(),
                )
            })
            .map(|r| Arc::clone(&r.agent))
            .ok_or_else(|| {
                ConvoyError::Agent(format!(
                    "no available agent of type '{}' with capabilities [{}]",
                    task.agent_type,
                    task.required_capabilities.join(", ")
                ))
            })
    }

    /// Count a new attempt against the agent.
    pub fn mark_busy(&self, id: &str, task_id: &str) {
        let mut agents = self.agents.write();
        if let Some(r) = agents.get_mut(id) {
            r.snapshot.active_tasks += 1;
            r.snapshot.current_task = Some(task_id.to_string());
            r.snapshot.status = AgentStatus::Busy;
        }
    }

    /// Record a successful attempt and return the updated snapshot.
    pub fn record_success(&self, id: &str, duration_ms: u64, now: DateTime<Utc>) -> Option<AgentSnapshot> {
        let mut agents = self.agents.write();
        let r = agents.get_mut(id)?;
        let usage = r.agent.resource_usage();
        let s = &mut r.snapshot;
        s.metrics.successful_executions += 1;
        record_execution(&mut s.metrics, duration_ms, usage);
        s.health.last_check = Some(now);
        // Only `reset` brings a failed agent back.
        if s.status != AgentStatus::Failed {
            s.health.consecutive_failures = 0;
            s.health.is_healthy = true;
        }
        release(s);
        Some(s.clone())
    }

    /// Record a failed attempt. The agent is marked failed once it reaches
    /// `failure_limit` consecutive failures, recovering before that.
    pub fn record_failure(
        &self,
        id: &str,
        duration_ms: u64,
        error: &str,
        failure_limit: u32,
        now: DateTime<Utc>,
    ) -> Option<AgentSnapshot> {
        let mut agents = self.agents.write();
        let r = agents.get_mut(id)?;
        let usage = r.agent.resource_usage();
        let s = &mut r.snapshot;
        s.metrics.failed_executions += 1;
        record_execution(&mut s.metrics, duration_ms, usage);
        s.health.consecutive_failures += 1;
        s.health.last_check = Some(now);
        s.health.issues.push(error.to_string());
        if s.health.issues.len() > MAX_ISSUES {
            s.health.issues.remove(0);
        }
        release(s);
        if s.status == AgentStatus::Offline {
            return Some(s.clone());
        }
        if s.health.consecutive_failures >= failure_limit {
            s.status = AgentStatus::Failed;
            s.health.is_healthy = false;
            warn!(
                agent_id = %id,
                consecutive_failures = s.health.consecutive_failures,
                "Agent marked as failed"
            );
        } else {
            s.status = AgentStatus::Recovering;
        }
        Some(s.clone())
    }

    /// Clear a failed or recovering agent back to idle.
    pub fn reset(&self, id: &str) -> bool {
        let mut agents = self.agents.write();
        let Some(r) = agents.get_mut(id) else {
            return false;
        };
        r.snapshot.status = if r.snapshot.active_tasks > 0 {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        };
        r.snapshot.health = AgentHealth::default();
        info!(agent_id = %id, "Agent reset");
        true
    }

    /// Take an agent out of selection. Attempts already running still
    /// record their metrics.
    pub fn set_offline(&self, id: &str) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(r) => {
                r.snapshot.status = AgentStatus::Offline;
                true
            }
            None => false,
        }
    }

    /// Return an offline agent to selection. Other statuses are untouched.
    pub fn bring_online(&self, id: &str) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(r) if r.snapshot.status == AgentStatus::Offline => {
                r.snapshot.status = if r.snapshot.active_tasks > 0 {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                };
                true
            }
            _ => false,
        }
    }

    /// Registered agent ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of one agent.
    pub fn snapshot(&self, id: &str) -> Option<AgentSnapshot> {
        self.agents.read().get(id).map(|r| r.snapshot.clone())
    }

    /// All agents, sorted by id.
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut list: Vec<AgentSnapshot> = self
            .agents
            .read()
            .values()
            .map(|r| r.snapshot.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHealthSource for AgentRegistry {
    fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.snapshots()
    }
}

fn record_execution(metrics: &mut AgentMetrics, duration_ms: u64, usage: ResourceUsage) {
    metrics.total_executions += 1;
    let n = metrics.total_executions as f64;
    metrics.average_execution_time_ms += (duration_ms as f64 - metrics.average_execution_time_ms) / n;
    metrics.last_execution_time_ms = duration_ms;
    metrics.memory_usage = usage.memory_usage;
    metrics.cpu_usage = usage.cpu_usage;
}

fn release(snapshot: &mut AgentSnapshot) {
    snapshot.active_tasks = snapshot.active_tasks.saturating_sub(1);
    if snapshot.active_tasks == 0 {
        snapshot.current_task = None;
        if !matches!(snapshot.status, AgentStatus::Failed | AgentStatus::Offline) {
            snapshot.status = AgentStatus::Idle;
        }
    }
}
