//! A2A message envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::task::AgentId;

/// Point-to-point notification between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub sender: AgentId,
    pub recipient: AgentId,
    /// Opaque to the bus
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(sender: AgentId, recipient: AgentId, payload: JsonValue) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender,
            recipient,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Result of [`super::MessageBus::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queued in the recipient mailbox under this message id
    Delivered(String),
    /// Recipient has no mailbox; the message was dropped
    NotSubscribed,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}
