use chrono::{DateTime, Utc};
use convoy_core::Payload;
use serde::{Deserialize, Serialize};

/// Delivery priority of a bus message.
///
/// Only [`MessagePriority::Urgent`] messages are redelivered after a failed delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background chatter.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Delivered like `Normal`; kept for callers that rank messages.
    High,
    /// Redelivered after a failed delivery, up to the bus limits.
    Urgent,
}

/// A message owned by the bus from enqueue until delivery or cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Assigned by the bus on `send`.
    pub id: String,
    /// Sender id.
    pub from: String,
    /// Recipient agent id.
    pub to: String,
    /// Routing key; subscription filters match on it.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque body.
    pub payload: Payload,
    /// Enqueue time, set by the bus clock.
    pub timestamp: DateTime<Utc>,
    /// Delivery priority.
    #[serde(default)]
    pub priority: MessagePriority,
    /// Links a reply to the message it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A message as submitted by a sender, before the bus assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Sender id.
    pub from: String,
    /// Recipient agent id.
    pub to: String,
    /// Routing key; subscription filters match on it.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque body.
    pub payload: Payload,
    /// Delivery priority.
    #[serde(default)]
    pub priority: MessagePriority,
    /// Links a reply to the message it answers.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl OutgoingMessage {
    /// A normal-priority message from `from` to `to`.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_type: message_type.into(),
            payload,
            priority: MessagePriority::Normal,
            correlation_id: None,
        }
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Tag the message with a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub(crate) fn stamp(self, id: String, timestamp: DateTime<Utc>) -> AgentMessage {
        AgentMessage {
            id,
            from: self.from,
            to: self.to,
            message_type: self.message_type,
            payload: self.payload,
            timestamp,
            priority: self.priority,
            correlation_id: self.correlation_id,
        }
    }
}

/// A message fanned out to every subscribed agent; it has no recipient of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Sender id.
    pub from: String,
    /// Routing key for every copy.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Body shared by every copy.
    pub payload: Payload,
    /// Priority of every copy.
    #[serde(default)]
    pub priority: MessagePriority,
    /// Copied onto every addressed message.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl BroadcastMessage {
    /// A normal-priority broadcast.
    pub fn new(from: impl Into<String>, message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            message_type: message_type.into(),
            payload,
            priority: MessagePriority::Normal,
            correlation_id: None,
        }
    }

    /// Set the priority of every copy.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// The point-to-point copy of this broadcast for one recipient.
    pub fn addressed_to(&self, to: impl Into<String>) -> OutgoingMessage {
        OutgoingMessage {
            from: self.from.clone(),
            to: to.into(),
            message_type: self.message_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_default_is_normal() {
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = OutgoingMessage::new("a", "b", "status", serde_json::json!({"ok": true}))
            .with_priority(MessagePriority::Urgent)
            .with_correlation_id("req-1")
            .stamp("msg_1".into(), Utc::now());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["priority"], "urgent");
        assert_eq!(json["correlationId"], "req-1");
    }

    #[test]
    fn test_broadcast_addressed_to() {
        let b = BroadcastMessage::new("coordinator", "shutdown", serde_json::Value::Null)
            .with_priority(MessagePriority::High);
        let out = b.addressed_to("agent-7");
        assert_eq!(out.to, "agent-7");
        assert_eq!(out.from, "coordinator");
        assert_eq!(out.priority, MessagePriority::High);
    }
}
