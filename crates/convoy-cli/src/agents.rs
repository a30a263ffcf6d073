//! Demo agents instantiated from `[[agents]]` entries.
//!
//! These exist so `convoy serve` and `convoy run` have something to execute.
//! Real deployments register their own [`Agent`] implementations.

use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult, Payload};
use convoy_orchestrator::{Agent, AgentSpec, TaskDefinition};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Build the agent described by `spec`.
///
/// Known kinds: `echo`, `sleep` (`options.delay_ms`, default 100) and
/// `flaky` (`options.fail_every`, default 2: every n-th call fails).
pub fn build_agent(spec: &AgentSpec) -> ConvoyResult<Arc<dyn Agent>> {
    let base = Base {
        id: spec.id.clone(),
        agent_type: spec.agent_type.clone(),
        capabilities: spec.capabilities.clone(),
    };
    let agent: Arc<dyn Agent> = match spec.kind.as_str() {
        "echo" => Arc::new(EchoAgent { base }),
        "sleep" => Arc::new(SleepAgent {
            base,
            delay: Duration::from_millis(option_u64(&spec.options, "delay_ms").unwrap_or(100)),
        }),
        "flaky" => {
            let fail_every = option_u64(&spec.options, "fail_every").unwrap_or(2);
            if fail_every == 0 {
                return Err(ConvoyError::Config(format!(
                    "agent '{}': fail_every must be at least 1",
                    spec.id
                )));
            }
            Arc::new(FlakyAgent {
                base,
                fail_every,
                calls: AtomicU64::new(0),
            })
        }
        other => {
            return Err(ConvoyError::Config(format!(
                "agent '{}': unknown kind '{other}'",
                spec.id
            )))
        }
    };
    Ok(agent)
}

fn option_u64(options: &Payload, key: &str) -> Option<u64> {
    options.get(key).and_then(Payload::as_u64)
}

struct Base {
    id: String,
    agent_type: String,
    capabilities: Vec<String>,
}

/// Returns the task's config unchanged.
struct EchoAgent {
    base: Base,
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.base.id
    }
    fn agent_type(&self) -> &str {
        &self.base.agent_type
    }
    fn capabilities(&self) -> Vec<String> {
        self.base.capabilities.clone()
    }
    async fn execute(&self, task: &TaskDefinition) -> ConvoyResult<Payload> {
        Ok(json!({ "task": task.id, "echo": task.config }))
    }
}

/// Sleeps for a fixed delay, then succeeds.
struct SleepAgent {
    base: Base,
    delay: Duration,
}

#[async_trait]
impl Agent for SleepAgent {
    fn id(&self) -> &str {
        &self.base.id
    }
    fn agent_type(&self) -> &str {
        &self.base.agent_type
    }
    fn capabilities(&self) -> Vec<String> {
        self.base.capabilities.clone()
    }
    async fn execute(&self, task: &TaskDefinition) -> ConvoyResult<Payload> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "task": task.id, "sleptMs": self.delay.as_millis() as u64 }))
    }
}

struct FlakyAgent {
    base: Base,
    fail_every: u64,
    calls: AtomicU64,
}

#[async_trait]
impl Agent for FlakyAgent {
    fn id(&self) -> &str {
        &self.base.id
    }
    fn agent_type(&self) -> &str {
        &self.base.agent_type
    }
    fn capabilities(&self) -> Vec<String> {
        self.base.capabilities.clone()
    }
    async fn execute(&self, task: &TaskDefinition) -> ConvoyResult<Payload> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % self.fail_every == 0 {
            return Err(ConvoyError::Execution(format!(
                "{} failed call {call} of task {}",
                self.base.id, task.id
            )));
        }
        Ok(json!({ "task": task.id, "call": call }))
    }
}
