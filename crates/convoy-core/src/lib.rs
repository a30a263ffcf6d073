//! Core types and error definitions for the Convoy orchestration core.
//!
//! This crate provides the foundational pieces shared by the message bus, the
//! scheduler, the workflow engine and the health monitor.
//!
//! # Main types
//!
//! - [`ConvoyError`]: Unified error enum for all Convoy subsystems.
//! - [`ConvoyResult`]: Convenience alias for `Result<T, ConvoyError>`.
//! - [`Payload`]: Opaque serializable value carried by messages, task configs and results.
//! - [`EventEmitter`]: Synchronous named-event fan-out (`on` / `emit`).
//! - [`Clock`]: Injected time source ([`SystemClock`], [`ManualClock`]).
//! - [`BoundedLog`]: Ring buffer that evicts its oldest entries first.

/// Injectable time sources.
pub mod clock;
/// Named-event subscription and fan-out.
pub mod event;
/// Capped append-only ring buffer.
pub mod log;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{EventEmitter, EventHandler};
pub use log::BoundedLog;

// --- Error types ---

/// Top-level error type for the Convoy orchestration core.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum ConvoyError {
    /// An error raised while routing or delivering a bus message.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error from the task scheduler.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error from the workflow engine (invalid or blocked workflow).
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error raised while sampling system or agent health.
    #[error("Health error: {0}")]
    Health(String),

    /// An error raised by an agent or during agent resolution.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A lookup of an unknown task, workflow, agent or message id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unit of work failed while executing.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConvoyError`].
pub type ConvoyResult<T> = Result<T, ConvoyError>;

// --- Payload ---

/// Opaque value routed and stored by the core but never interpreted by it.
///
/// Message payloads, task configuration and task results all use this type.
pub type Payload = serde_json::Value;

/// Generates a fresh identifier with the given prefix, e.g. `task_3f2a9c1b...`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_prefix() {
        let id = generate_id("msg");
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), "msg_".len() + 32);
    }

    #[test]
    fn test_generate_id_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_id("task")).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_error_display() {
        let err = ConvoyError::Workflow("blocked".into());
        assert_eq!(err.to_string(), "Workflow error: blocked");
    }
}
