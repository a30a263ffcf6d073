use crate::config::MonitorConfig;
use crate::probe::{SysinfoProbe, SystemProbe, SystemSample};
use crate::types::{AgentSnapshot, AgentStatus};
use chrono::{DateTime, Utc};
use convoy_core::{
    generate_id, BoundedLog, Clock, ConvoyError, ConvoyResult, EventEmitter, Payload, SystemClock,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Raised with every alert.
pub const ALERT_EVENT: &str = "alert";
/// Raised with every recorded health check.
pub const HEALTH_CHECK_EVENT: &str = "health_check";

/// Classification of a health check. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Within every threshold.
    Healthy,
    /// Above a threshold.
    Warning,
    /// At or above the critical utilization.
    Critical,
}

/// What a health check looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// One registered agent.
    Agent,
    /// Host sample: CPU, memory, disk and connectivity.
    System,
    /// A single resource reading.
    Resource,
}

/// Severity of an [`Alert`]. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// A threshold was exceeded.
    Warning,
    /// An operation failed.
    Error,
    /// Critical utilization or a failed agent.
    Critical,
}

impl AlertSeverity {
    /// Lowercase name, as used in event names.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }

    /// Name of the severity-specific alert event, e.g. `alert_critical`.
    pub fn event_name(self) -> String {
        format!("{ALERT_EVENT}_{}", self.as_str())
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Unique check id.
    pub id: String,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// What was checked.
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Verdict.
    pub status: HealthStatus,
    /// Readings and issues behind the verdict.
    pub details: Payload,
}

/// A threshold breach or failure worth reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert id.
    pub id: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub severity: AlertSeverity,
    /// Human-readable summary.
    pub message: String,
    /// `system` or the id of the agent concerned.
    pub source: String,
    /// Readings that triggered the alert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Payload>,
}

/// Limits compared against every sample. Percentages are 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// CPU usage percent.
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    /// Memory usage percent.
    #[serde(default = "default_memory")]
    pub memory: f64,
    /// Disk usage percent.
    #[serde(default = "default_disk")]
    pub disk: f64,
    /// Latest agent execution time, in milliseconds.
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: u64,
    /// Agent error rate percent.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Consecutive failures after which an agent is considered failed.
    #[serde(default = "default_agent_failures")]
    pub agent_failures: u32,
    /// Utilization at or above which a breach is critical instead of a warning.
    #[serde(default = "default_critical_utilization")]
    pub critical_utilization: f64,
}

fn default_cpu() -> f64 {
    80.0
}
fn default_memory() -> f64 {
    85.0
}
fn default_disk() -> f64 {
    90.0
}
fn default_response_time_ms() -> u64 {
    5000
}
fn default_error_rate() -> f64 {
    10.0
}
fn default_agent_failures() -> u32 {
    3
}
fn default_critical_utilization() -> f64 {
    95.0
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            disk: default_disk(),
            response_time_ms: default_response_time_ms(),
            error_rate: default_error_rate(),
            agent_failures: default_agent_failures(),
            critical_utilization: default_critical_utilization(),
        }
    }
}

impl HealthThresholds {
    /// Reject percentages outside 0-100 and a zero failure limit.
    pub fn validate(&self) -> ConvoyResult<()> {
        let percentages = [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("disk", self.disk),
            ("error_rate", self.error_rate),
            ("critical_utilization", self.critical_utilization),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConvoyError::Config(format!(
                    "threshold '{name}' must be between 0 and 100, got {value}"
                )));
            }
        }
        if self.agent_failures == 0 {
            return Err(ConvoyError::Config("threshold 'agent_failures' must be at least 1".into()));
        }
        Ok(())
    }

    /// Merge the fields set in `update`.
    pub fn apply(&mut self, update: &HealthThresholdsUpdate) {
        if let Some(v) = update.cpu {
            self.cpu = v;
        }
        if let Some(v) = update.memory {
            self.memory = v;
        }
        if let Some(v) = update.disk {
            self.disk = v;
        }
        if let Some(v) = update.response_time_ms {
            self.response_time_ms = v;
        }
        if let Some(v) = update.error_rate {
            self.error_rate = v;
        }
        if let Some(v) = update.agent_failures {
            self.agent_failures = v;
        }
        if let Some(v) = update.critical_utilization {
            self.critical_utilization = v;
        }
    }

    fn classify(&self, value: f64, limit: f64) -> Option<HealthStatus> {
        if value >= self.critical_utilization.max(limit) {
            Some(HealthStatus::Critical)
        } else if value > limit {
            Some(HealthStatus::Warning)
        } else {
            None
        }
    }
}

/// A partial threshold set for [`HealthMonitor::set_thresholds`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholdsUpdate {
    /// New CPU limit.
    pub cpu: Option<f64>,
    /// New memory limit.
    pub memory: Option<f64>,
    /// New disk limit.
    pub disk: Option<f64>,
    /// New response time limit.
    pub response_time_ms: Option<u64>,
    /// New error rate limit.
    pub error_rate: Option<f64>,
    /// New consecutive failure limit.
    pub agent_failures: Option<u32>,
    /// New critical utilization.
    pub critical_utilization: Option<f64>,
}

impl From<&HealthThresholds> for HealthThresholdsUpdate {
    fn from(t: &HealthThresholds) -> Self {
        Self {
            cpu: Some(t.cpu),
            memory: Some(t.memory),
            disk: Some(t.disk),
            response_time_ms: Some(t.response_time_ms),
            error_rate: Some(t.error_rate),
            agent_failures: Some(t.agent_failures),
            critical_utilization: Some(t.critical_utilization),
        }
    }
}

/// Agents checked on every periodic tick.
pub trait AgentHealthSource: Send + Sync {
    /// Current snapshot of every agent to check.
    fn agent_snapshots(&self) -> Vec<AgentSnapshot>;
}

/// Counters over the health and alert logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    /// Checks currently in the log.
    pub total_checks: usize,
    /// Alerts currently in the log.
    pub total_alerts: usize,
    /// Healthy share of checks in the last hour, 0-100.
    pub system_health: f64,
    /// Status of the newest check.
    pub latest_status: Option<HealthStatus>,
    /// Logged checks per status.
    pub checks_by_status: HashMap<HealthStatus, usize>,
    /// Logged alerts per severity.
    pub alerts_by_severity: HashMap<AlertSeverity, usize>,
    /// Thresholds in effect.
    pub thresholds: HealthThresholds,
    /// Whether the periodic driver is running.
    pub is_running: bool,
}

/// Accumulates the verdict of one check.
struct Findings {
    status: HealthStatus,
    issues: Vec<(AlertSeverity, String)>,
}

impl Findings {
    fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
        }
    }

    fn raise(&mut self, status: HealthStatus, severity: AlertSeverity, message: String) {
        self.status = self.status.max(status);
        self.issues.push((severity, message));
    }

    fn breach(&mut self, status: Option<HealthStatus>, message: impl FnOnce() -> String) {
        match status {
            Some(HealthStatus::Critical) => {
                self.raise(HealthStatus::Critical, AlertSeverity::Critical, message())
            }
            Some(HealthStatus::Warning) => {
                self.raise(HealthStatus::Warning, AlertSeverity::Warning, message())
            }
            _ => {}
        }
    }

    fn messages(&self) -> Vec<&str> {
        self.issues.iter().map(|(_, m)| m.as_str()).collect()
    }
}

/// Samples system and agent condition, classifies it and raises alerts.
///
/// Checks and alerts are kept in separate capped logs. A failing host sample
/// still yields exactly one check, classified critical.
pub struct HealthMonitor {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SystemProbe>,
    thresholds: RwLock<HealthThresholds>,
    checks: Mutex<BoundedLog<HealthCheck>>,
    alerts: Mutex<BoundedLog<Alert>>,
    events: EventEmitter<Payload>,
    agents: RwLock<Option<Arc<dyn AgentHealthSource>>>,
    interval: Duration,
    running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// A monitor sampling the host with `sysinfo`.
    pub fn new(config: &MonitorConfig) -> Self {
        let probe = SysinfoProbe::new(
            config.connectivity_target.clone(),
            Duration::from_millis(config.connectivity_timeout_ms),
        );
        Self::with_parts(config, SystemClock::shared(), Arc::new(probe))
    }

    /// A monitor with an injected clock and host sampler.
    pub fn with_parts(config: &MonitorConfig, clock: Arc<dyn Clock>, probe: Arc<dyn SystemProbe>) -> Self {
        Self {
            clock,
            probe,
            thresholds: RwLock::new(config.thresholds.clone()),
            checks: Mutex::new(BoundedLog::new(config.max_health_checks)),
            alerts: Mutex::new(BoundedLog::new(config.max_alerts)),
            events: EventEmitter::new(),
            agents: RwLock::new(None),
            interval: Duration::from_secs(config.check_interval_secs.max(1)),
            running: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// Observe [`ALERT_EVENT`], a severity event such as `alert_critical`,
    /// or [`HEALTH_CHECK_EVENT`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Payload) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    /// Agents to check on every periodic tick.
    pub fn set_agent_source(&self, source: Arc<dyn AgentHealthSource>) {
        *self.agents.write() = Some(source);
    }

    // --- Checks ---

    /// Sample the host and compare against the thresholds.
    pub async fn perform_system_health_check(&self) -> HealthCheck {
        let thresholds = self.get_thresholds();
        match self.probe.sample().await {
            Ok(sample) => {
                let findings = Self::evaluate_system(&sample, &thresholds);
                let details = json!({
                    "cpuUsage": sample.cpu_usage,
                    "memoryUsage": sample.memory_usage,
                    "diskUsage": sample.disk_usage,
                    "networkRxBytes": sample.network_rx_bytes,
                    "networkTxBytes": sample.network_tx_bytes,
                    "connectivity": sample.connectivity,
                    "issues": findings.messages(),
                });
                self.conclude(CheckType::System, "system", findings, details)
            }
            Err(e) => {
                error!(error = %e, "System health check failed");
                let mut findings = Findings::new();
                findings.raise(
                    HealthStatus::Critical,
                    AlertSeverity::Critical,
                    format!("System health check failed: {e}"),
                );
                let details = json!({ "error": e.to_string() });
                self.conclude(CheckType::System, "system", findings, details)
            }
        }
    }

    fn evaluate_system(sample: &SystemSample, t: &HealthThresholds) -> Findings {
        let mut findings = Findings::new();
        findings.breach(t.classify(sample.cpu_usage, t.cpu), || {
            format!("High CPU usage: {:.1}% (threshold {:.1}%)", sample.cpu_usage, t.cpu)
        });
        findings.breach(t.classify(sample.memory_usage, t.memory), || {
            format!("High memory usage: {:.1}% (threshold {:.1}%)", sample.memory_usage, t.memory)
        });
        findings.breach(t.classify(sample.disk_usage, t.disk), || {
            format!("High disk usage: {:.1}% (threshold {:.1}%)", sample.disk_usage, t.disk)
        });
        if sample.connectivity == Some(false) {
            findings.raise(
                HealthStatus::Critical,
                AlertSeverity::Error,
                "Network connectivity lost".to_string(),
            );
        }
        findings
    }

    /// Inspect one agent's snapshot.
    pub fn perform_agent_health_check(&self, agent_id: &str, agent: &AgentSnapshot) -> HealthCheck {
        let t = self.get_thresholds();
        let mut findings = Findings::new();

        match agent.status {
            AgentStatus::Failed => findings.raise(
                HealthStatus::Critical,
                AlertSeverity::Critical,
                format!("Agent {agent_id} has failed"),
            ),
            AgentStatus::Recovering => findings.raise(
                HealthStatus::Warning,
                AlertSeverity::Warning,
                format!("Agent {agent_id} is recovering"),
            ),
            _ => {}
        }
        if !agent.health.is_healthy {
            findings.raise(
                HealthStatus::Critical,
                AlertSeverity::Critical,
                format!("Agent {agent_id} reports unhealthy"),
            );
        }
        if agent.health.consecutive_failures >= t.agent_failures {
            findings.raise(
                HealthStatus::Critical,
                AlertSeverity::Error,
                format!(
                    "Agent {agent_id} failed {} times in a row (limit {})",
                    agent.health.consecutive_failures, t.agent_failures
                ),
            );
        }

        let metrics = &agent.metrics;
        let error_rate = metrics.error_rate();
        if metrics.total_executions > 0 && error_rate > t.error_rate {
            findings.raise(
                HealthStatus::Warning,
                AlertSeverity::Warning,
                format!("Agent {agent_id} error rate {error_rate:.1}% exceeds {:.1}%", t.error_rate),
            );
        }
        if metrics.last_execution_time_ms > t.response_time_ms {
            findings.raise(
                HealthStatus::Warning,
                AlertSeverity::Warning,
                format!(
                    "Agent {agent_id} response time {}ms exceeds {}ms",
                    metrics.last_execution_time_ms, t.response_time_ms
                ),
            );
        }
        findings.breach(t.classify(metrics.memory_usage, t.memory), || {
            format!("Agent {agent_id} memory usage {:.1}%", metrics.memory_usage)
        });
        findings.breach(t.classify(metrics.cpu_usage, t.cpu), || {
            format!("Agent {agent_id} CPU usage {:.1}%", metrics.cpu_usage)
        });

        let details = json!({
            "agentId": agent_id,
            "agentType": agent.agent_type,
            "agentStatus": agent.status,
            "errorRate": error_rate,
            "lastExecutionTimeMs": metrics.last_execution_time_ms,
            "memoryUsage": metrics.memory_usage,
            "cpuUsage": metrics.cpu_usage,
            "consecutiveFailures": agent.health.consecutive_failures,
            "issues": findings.messages(),
        });
        self.conclude(CheckType::Agent, &format!("agent:{agent_id}"), findings, details)
    }

    fn conclude(&self, check_type: CheckType, source: &str, findings: Findings, details: Payload) -> HealthCheck {
        let check = HealthCheck {
            id: generate_id("check"),
            timestamp: self.clock.now(),
            check_type,
            status: findings.status,
            details,
        };
        self.checks.lock().push(check.clone());
        debug!(check_id = %check.id, source = %source, status = ?check.status, "Health check recorded");

        for (severity, message) in findings.issues {
            self.create_alert(severity, message, source, Some(json!({ "checkId": check.id })));
        }
        self.events.emit_quiet(
            HEALTH_CHECK_EVENT,
            &serde_json::to_value(&check).unwrap_or_default(),
        );
        check
    }

    /// Append an alert and raise both [`ALERT_EVENT`] and its severity event.
    pub fn create_alert(
        &self,
        severity: AlertSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
        details: Option<Payload>,
    ) -> Alert {
        let alert = Alert {
            id: generate_id("alert"),
            timestamp: self.clock.now(),
            severity,
            message: message.into(),
            source: source.into(),
            details,
        };
        match severity {
            AlertSeverity::Critical | AlertSeverity::Error => {
                error!(source = %alert.source, severity = %severity, "{}", alert.message)
            }
            AlertSeverity::Warning => warn!(source = %alert.source, "{}", alert.message),
            AlertSeverity::Info => info!(source = %alert.source, "{}", alert.message),
        }
        self.alerts.lock().push(alert.clone());

        let payload = serde_json::to_value(&alert).unwrap_or_default();
        self.events.emit_quiet(ALERT_EVENT, &payload);
        self.events.emit_quiet(&severity.event_name(), &payload);
        alert
    }

    // --- Views ---

    /// Healthy share (0-100) of the checks recorded in the last hour;
    /// 100 when there are none.
    pub fn get_system_health(&self) -> f64 {
        let cutoff = self.clock.now() - chrono::Duration::hours(1);
        let checks = self.checks.lock();
        let (healthy, total) = checks
            .iter()
            .filter(|c| c.timestamp >= cutoff)
            .fold((0usize, 0usize), |(h, n), c| {
                (h + usize::from(c.status == HealthStatus::Healthy), n + 1)
            });
        if total == 0 {
            100.0
        } else {
            healthy as f64 / total as f64 * 100.0
        }
    }

    /// Merge `update` into the thresholds used by future checks.
    pub fn set_thresholds(&self, update: HealthThresholdsUpdate) -> ConvoyResult<()> {
        let mut merged = self.get_thresholds();
        merged.apply(&update);
        merged.validate()?;
        *self.thresholds.write() = merged;
        info!("Health thresholds updated");
        Ok(())
    }

    /// A copy of the thresholds in effect.
    pub fn get_thresholds(&self) -> HealthThresholds {
        self.thresholds.read().clone()
    }

    /// Newest `limit` checks, oldest first.
    pub fn get_recent_checks(&self, limit: usize) -> Vec<HealthCheck> {
        self.checks.lock().recent(limit)
    }

    /// Newest `limit` alerts, oldest first.
    pub fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().recent(limit)
    }

    /// Counters over the logs, plus the current health score.
    pub fn get_health_stats(&self) -> HealthStats {
        let system_health = self.get_system_health();
        let (total_checks, latest_status, checks_by_status) = {
            let checks = self.checks.lock();
            let mut by_status = HashMap::new();
            for check in checks.iter() {
                *by_status.entry(check.status).or_insert(0) += 1;
            }
            (checks.len(), checks.last().map(|c| c.status), by_status)
        };
        let (total_alerts, alerts_by_severity) = {
            let alerts = self.alerts.lock();
            let mut by_severity = HashMap::new();
            for alert in alerts.iter() {
                *by_severity.entry(alert.severity).or_insert(0) += 1;
            }
            (alerts.len(), by_severity)
        };
        HealthStats {
            total_checks,
            total_alerts,
            system_health,
            latest_status,
            checks_by_status,
            alerts_by_severity,
            thresholds: self.get_thresholds(),
            is_running: self.is_running(),
        }
    }

    // --- Driver ---

    /// Whether the periodic driver is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One system check plus one check per agent of the agent source.
    pub async fn run_checks(&self) {
        self.perform_system_health_check().await;
        let source = self.agents.read().clone();
        if let Some(source) = source {
            for agent in source.agent_snapshots() {
                self.perform_agent_health_check(&agent.id, &agent);
            }
        }
    }

    /// Check immediately, then every `check_interval_secs` until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !monitor.is_running() {
                    continue;
                }
                monitor.run_checks().await;
            }
        });
        *self.driver.lock() = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "Health monitor started");
    }

    /// Stop the periodic driver. Logs are kept.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        info!("Health monitor stopped");
    }
}
