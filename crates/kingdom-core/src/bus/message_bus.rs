//! In-process A2A message bus
//!
//! One mailbox per subscribed agent plus an append-only history of every
//! delivered envelope.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::envelope::{Delivery, MessageEnvelope};
use crate::task::{AgentId, WaitQueue};

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub subscribers: usize,
    /// Envelopes delivered since creation
    pub total_messages: usize,
    /// Sends addressed to agents without a mailbox
    pub dropped_messages: usize,
    pub subscriber_ids: Vec<AgentId>,
}

/// Per-agent mailboxes with delivery history
pub struct MessageBus {
    mailboxes: DashMap<AgentId, Arc<WaitQueue<MessageEnvelope>>>,
    history: Mutex<Vec<MessageEnvelope>>,
    dropped: AtomicUsize,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            mailboxes: DashMap::new(),
            history: Mutex::new(Vec::new()),
            dropped: AtomicUsize::new(0),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<MessageEnvelope>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a mailbox for `agent_id`. Subscribing twice keeps the first one.
    pub fn subscribe(&self, agent_id: &AgentId) {
        let mut created = false;
        self.mailboxes.entry(agent_id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(WaitQueue::new())
        });

        if created {
            info!(agent = %agent_id, "Agent subscribed to message bus");
        }
    }

    /// Remove the mailbox of `agent_id`, discarding anything still queued
    ///
    /// Returns the number of discarded envelopes.
    pub fn unsubscribe(&self, agent_id: &AgentId) -> usize {
        let Some((_, mailbox)) = self.mailboxes.remove(agent_id) else {
            return 0;
        };

        let discarded = mailbox.drain().len();
        if discarded > 0 {
            warn!(agent = %agent_id, discarded, "Discarded undelivered messages on unsubscribe");
        }
        info!(agent = %agent_id, "Agent unsubscribed from message bus");
        discarded
    }

    pub fn is_subscribed(&self, agent_id: &AgentId) -> bool {
        self.mailboxes.contains_key(agent_id)
    }

    /// Deliver `payload` from `sender` to the mailbox of `recipient`
    pub fn send(&self, sender: &AgentId, recipient: &AgentId, payload: JsonValue) -> Delivery {
        // Push under the entry guard; unsubscribe waits for it
        let Some(mailbox) = self.mailboxes.get(recipient) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(sender = %sender, recipient = %recipient, "Recipient not subscribed, message dropped");
            return Delivery::NotSubscribed;
        };

        let envelope = MessageEnvelope::new(sender.clone(), recipient.clone(), payload);
        let message_id = envelope.message_id.clone();

        self.lock_history().push(envelope.clone());
        mailbox.push(envelope);
        drop(mailbox);

        debug!(sender = %sender, recipient = %recipient, message_id = %message_id, "Message delivered");
        Delivery::Delivered(message_id)
    }

    /// Next envelope for `agent_id`, waiting up to `timeout`
    ///
    /// Returns `None` at once when the agent has no mailbox.
    pub async fn receive(&self, agent_id: &AgentId, timeout: Duration) -> Option<MessageEnvelope> {
        let mailbox = self
            .mailboxes
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))?;

        mailbox.pop_timeout(timeout).await
    }

    /// Every delivered envelope in delivery order
    pub fn history(&self) -> Vec<MessageEnvelope> {
        self.lock_history().clone()
    }

    pub fn stats(&self) -> MessageStats {
        let mut subscriber_ids: Vec<AgentId> =
            self.mailboxes.iter().map(|entry| entry.key().clone()).collect();
        subscriber_ids.sort();

        MessageStats {
            subscribers: subscriber_ids.len(),
            total_messages: self.lock_history().len(),
            dropped_messages: self.dropped.load(Ordering::Relaxed),
            subscriber_ids,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
