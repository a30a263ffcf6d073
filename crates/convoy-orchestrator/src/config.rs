//! Configuration for the orchestration core.
//!
//! A single [`ConvoyConfig`] is read from `convoy.toml`. Every section and
//! every field is optional; missing values fall back to the documented
//! defaults.

use crate::health::HealthThresholds;
use convoy_bus::BusConfig;
use convoy_core::{ConvoyError, ConvoyResult, Payload};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// Message bus tunables.
    #[serde(default)]
    pub bus: BusConfig,
    /// Scheduler admission and tick rate.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Health monitor cadence, log caps and thresholds.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Workflow engine history.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Agents to instantiate at startup. Only consumed by the CLI.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tasks admitted at once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Period of the admission loop while started.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Terminal executions kept for inspection.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between periodic health checks.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Health checks kept in the log.
    #[serde(default = "default_log_cap")]
    pub max_health_checks: usize,
    /// Alerts kept in the log.
    #[serde(default = "default_log_cap")]
    pub max_alerts: usize,
    /// Limits that raise alerts.
    #[serde(default)]
    pub thresholds: HealthThresholds,
    /// `host:port` probed with a TCP connect during system checks.
    /// Connectivity is not checked when unset.
    #[serde(default)]
    pub connectivity_target: Option<String>,
    /// Timeout of the connectivity probe.
    #[serde(default = "default_connectivity_timeout_ms")]
    pub connectivity_timeout_ms: u64,
}

/// `[workflow]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Finished executions kept for `get_execution` and stats.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Declaration of an agent instance, as used by the CLI's demo agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent id, unique across the config.
    pub id: String,
    /// Type name tasks select on.
    pub agent_type: String,
    /// Capabilities advertised to task matching.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Implementation selector, e.g. `echo`, `sleep` or `flaky`.
    #[serde(default = "default_agent_kind")]
    pub kind: String,
    /// Free-form options interpreted by the selected implementation.
    #[serde(default, skip_serializing_if = "Payload::is_null")]
    pub options: Payload,
}

fn default_max_concurrent_tasks() -> usize {
    5
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_completed_retention() -> usize {
    1000
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_log_cap() -> usize {
    1000
}
fn default_connectivity_timeout_ms() -> u64 {
    2000
}
fn default_history_limit() -> usize {
    100
}
fn default_agent_kind() -> String {
    "echo".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            tick_interval_ms: default_tick_interval_ms(),
            completed_retention: default_completed_retention(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_health_checks: default_log_cap(),
            max_alerts: default_log_cap(),
            thresholds: HealthThresholds::default(),
            connectivity_target: None,
            connectivity_timeout_ms: default_connectivity_timeout_ms(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl ConvoyConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConvoyResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConvoyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> ConvoyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvoyError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render the configuration as TOML, defaults included.
    pub fn to_toml_string(&self) -> ConvoyResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConvoyError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Reject values that would stall or disable a component.
    pub fn validate(&self) -> ConvoyResult<()> {
        let checks: [(bool, &str); 9] = [
            (self.scheduler.max_concurrent_tasks == 0, "scheduler.max_concurrent_tasks must be at least 1"),
            (self.scheduler.tick_interval_ms == 0, "scheduler.tick_interval_ms must be positive"),
            (self.scheduler.completed_retention == 0, "scheduler.completed_retention must be at least 1"),
            (self.monitor.check_interval_secs == 0, "monitor.check_interval_secs must be positive"),
            (self.monitor.max_health_checks == 0, "monitor.max_health_checks must be at least 1"),
            (self.monitor.max_alerts == 0, "monitor.max_alerts must be at least 1"),
            (self.bus.max_log_size == 0, "bus.max_log_size must be at least 1"),
            (self.bus.cleanup_interval_secs == 0, "bus.cleanup_interval_secs must be positive"),
            (self.workflow.history_limit == 0, "workflow.history_limit must be at least 1"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(ConvoyError::Config((*msg).to_string()));
        }
        self.monitor.thresholds.validate()?;

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(ConvoyError::Config(format!("Duplicate agent id '{}'", agent.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ConvoyConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 5);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.monitor.check_interval_secs, 30);
        assert_eq!(config.monitor.max_alerts, 1000);
        assert_eq!(config.monitor.thresholds.cpu, 80.0);
        assert_eq!(config.bus.urgent_queue_limit, 100);
        assert_eq!(config.workflow.history_limit, 100);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = ConvoyConfig::from_toml_str(
            r#"
[scheduler]
max_concurrent_tasks = 2

[monitor.thresholds]
cpu = 50.0

[[agents]]
id = "echo-1"
agent_type = "echo"
capabilities = ["text"]
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert_eq!(config.scheduler.completed_retention, 1000);
        assert_eq!(config.monitor.thresholds.cpu, 50.0);
        assert_eq!(config.monitor.thresholds.memory, 85.0);
        assert_eq!(config.agents[0].kind, "echo");
        assert_eq!(config.agents[0].capabilities, vec!["text"]);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ConvoyConfig::from_toml_str("[scheduler]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_tasks"));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let doc = r#"
[[agents]]
id = "a"
agent_type = "x"

[[agents]]
id = "a"
agent_type = "y"
"#;
        assert!(ConvoyConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let err = ConvoyConfig::from_toml_str("[[[nope").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut config = ConvoyConfig::default();
        config.scheduler.max_concurrent_tasks = 9;
        let text = config.to_toml_string().unwrap();
        let back = ConvoyConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.scheduler.max_concurrent_tasks, 9);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(
            &path,
            "[monitor]\ncheck_interval_secs = 5\n\n[monitor.thresholds]\ncpu = 70.0\n",
        )
        .unwrap();
        let config = ConvoyConfig::load(&path).unwrap();
        assert_eq!(config.monitor.check_interval_secs, 5);
        assert_eq!(config.monitor.thresholds.cpu, 70.0);
        assert_eq!(config.monitor.thresholds.memory, 85.0);

        let missing = ConvoyConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read config"));
    }
}
