use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};
use tokio::net::TcpStream;
use tracing::debug;

/// Point-in-time host utilization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSample {
    /// Percent.
    pub cpu_usage: f64,
    /// Percent of total memory in use.
    pub memory_usage: f64,
    /// Percent of total disk space in use, across all mounted disks.
    pub disk_usage: f64,
    /// Bytes received on all interfaces.
    pub network_rx_bytes: u64,
    /// Bytes sent on all interfaces.
    pub network_tx_bytes: u64,
    /// `None` when no connectivity target is configured.
    pub connectivity: Option<bool>,
}

/// Source of host samples for system health checks.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Take one sample.
    async fn sample(&self) -> ConvoyResult<SystemSample>;
}

/// [`SystemProbe`] backed by `sysinfo`, plus an optional TCP connect probe.
///
/// CPU usage is computed between two consecutive samples, so the first
/// sample of a fresh probe reports the usage since the probe was created.
pub struct SysinfoProbe {
    system: Arc<Mutex<System>>,
    connectivity_target: Option<String>,
    connectivity_timeout: Duration,
}

impl SysinfoProbe {
    /// A sampler that also connects to `connectivity_target` when set.
    pub fn new(connectivity_target: Option<String>, connectivity_timeout: Duration) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Arc::new(Mutex::new(system)),
            connectivity_target,
            connectivity_timeout,
        }
    }

    fn sample_host(system: &Mutex<System>) -> SystemSample {
        let mut system = system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let memory_usage = percent(system.used_memory(), system.total_memory());
        let cpu_usage = f64::from(system.global_cpu_usage());

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), disk| {
            (t + disk.total_space(), a + disk.available_space())
        });
        let disk_usage = percent(total.saturating_sub(available), total);

        let networks = Networks::new_with_refreshed_list();
        let (rx, tx) = networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });

        SystemSample {
            cpu_usage,
            memory_usage,
            disk_usage,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            connectivity: None,
        }
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn sample(&self) -> ConvoyResult<SystemSample> {
        let system = Arc::clone(&self.system);
        let mut sample = tokio::task::spawn_blocking(move || Self::sample_host(&system))
            .await
            .map_err(|e| ConvoyError::Health(format!("host sampling task failed: {e}")))?;
        if let Some(target) = &self.connectivity_target {
            sample.connectivity = Some(check_connectivity(target, self.connectivity_timeout).await);
        }
        Ok(sample)
    }
}

/// Whether a TCP connection to `target` (`host:port`) succeeds within `timeout`.
pub async fn check_connectivity(target: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "Connectivity probe failed");
            false
        }
        Err(_) => {
            debug!(target = %target, "Connectivity probe timed out");
            false
        }
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
