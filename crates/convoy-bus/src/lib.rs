//! In-process message bus for Convoy agents.
//!
//! Agents subscribe with an optional set of accepted message types and
//! exchange [`AgentMessage`]s point-to-point or by broadcast. Delivery is
//! at-least-once within the process: a single drain loop raises a type-named
//! event and a generic [`MESSAGE_DELIVERED`] event for each accepted message,
//! and urgent messages are redelivered after handler failures.
//!
//! # Main types
//!
//! - [`MessageBus`]: Queue, subscription table, message log and drain loop.
//! - [`OutgoingMessage`] / [`BroadcastMessage`]: What senders submit.
//! - [`AgentMessage`]: A stamped message as stored and delivered by the bus.
//! - [`MessageStats`]: Serializable activity snapshot.

/// The bus itself and its configuration.
pub mod bus;
/// Message types.
pub mod message;

pub use bus::{BusConfig, MessageBus, MessageStats, MESSAGE_DELIVERED, MESSAGE_FAILED};
pub use message::{AgentMessage, BroadcastMessage, MessagePriority, OutgoingMessage};
