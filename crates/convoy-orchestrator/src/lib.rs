//! Task scheduling, dependency-aware workflows, health monitoring and agent
//! coordination for Convoy.
//!
//! The [`Coordinator`] owns one [`MessageBus`](convoy_bus::MessageBus), one
//! [`TaskScheduler`], one [`WorkflowEngine`] and one [`HealthMonitor`], and
//! routes every task attempt to a registered [`Agent`] of the requested type.
//!
//! # Main types
//!
//! - [`Coordinator`]: Composition root; registers agents and executes tasks.
//! - [`TaskScheduler`]: Three-bucket priority queue with bounded concurrency, retries and recurring tasks.
//! - [`WorkflowEngine`]: Runs a DAG of tasks with maximal parallelism and per-step retry.
//! - [`HealthMonitor`]: Periodic system checks, per-agent checks and threshold alerts.
//! - [`AgentRegistry`]: Agent lookup, selection and per-agent metrics.
//! - [`ConvoyConfig`]: TOML configuration for every subsystem.

/// Agent trait and registry.
pub mod agent;
/// TOML configuration.
pub mod config;
/// Composition root.
pub mod coordinator;
/// Health checks, thresholds and alerts.
pub mod health;
/// Host sampling for system health checks.
pub mod probe;
/// Retry and backoff policies.
pub mod retry;
/// Priority task scheduler.
pub mod scheduler;
/// Workflow step state.
pub mod steps;
/// Shared task and agent types.
pub mod types;
/// Workflow engine.
pub mod workflow;

pub use agent::{Agent, AgentRegistry};
pub use config::{AgentSpec, ConvoyConfig, MonitorConfig, SchedulerConfig, WorkflowConfig};
pub use coordinator::{Coordinator, CoordinatorStatus, SystemMetrics};
pub use health::{
    AgentHealthSource, Alert, AlertSeverity, CheckType, HealthCheck, HealthMonitor, HealthStats,
    HealthStatus, HealthThresholds, HealthThresholdsUpdate,
};
pub use probe::{SysinfoProbe, SystemProbe, SystemSample};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{FailureOutcome, SchedulerStats, TaskDispatcher, TaskScheduler};
pub use steps::{StepStatus, WorkflowStep};
pub use types::{
    AgentHealth, AgentMetrics, AgentSnapshot, AgentStatus, ResourceUsage, ScheduledTask,
    TaskDefinition, TaskExecution, TaskPriority, TaskStatus,
};
pub use workflow::{
    TaskExecutor, WorkflowDefinition, WorkflowEngine, WorkflowExecution, WorkflowStats,
    WorkflowStatus,
};
