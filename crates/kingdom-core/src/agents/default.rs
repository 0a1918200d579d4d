//! Built-in handlers
//!
//! Small handlers used by the service binary and tests. Real business logic
//! plugs in through [`TaskHandler`] and [`MessageHandler`].

use std::sync::{Mutex, MutexGuard};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use super::handler::{AgentContext, MessageHandler, TaskHandler};
use crate::bus::{Delivery, MessageEnvelope};
use crate::task::{A2aRequest, Task, TaskPayload};

/// Returns the text of an `echo` task unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task, ctx: &AgentContext) -> anyhow::Result<JsonValue> {
        match &task.payload {
            TaskPayload::Echo(request) => {
                debug!(agent = %ctx.agent_id, task_id = %task.id, "Echoing");
                Ok(JsonValue::String(request.text.clone()))
            }
            other => bail!("echo agent cannot handle task type {}", other.task_type()),
        }
    }
}

/// Forwards A2A test tasks over the message bus
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayHandler;

impl RelayHandler {
    fn relay(ctx: &AgentContext, task: &Task, request: &A2aRequest) -> JsonValue {
        let payload = json!({
            "task_type": task.task_type(),
            "task_id": task.id,
            "message": request.message,
        });

        match ctx.send(&request.target_agent, payload) {
            Delivery::Delivered(message_id) => json!({
                "delivered": true,
                "target_agent": request.target_agent,
                "message_id": message_id,
            }),
            Delivery::NotSubscribed => json!({
                "delivered": false,
                "target_agent": request.target_agent,
            }),
        }
    }
}

#[async_trait]
impl TaskHandler for RelayHandler {
    async fn handle(&self, task: &Task, ctx: &AgentContext) -> anyhow::Result<JsonValue> {
        match &task.payload {
            TaskPayload::SendTestMessage(request)
            | TaskPayload::TestA2aCommunication(request)
            | TaskPayload::ValidateCommunication(request) => Ok(Self::relay(ctx, task, request)),
            TaskPayload::SendBroadcastTest(request) => {
                let recipients: Vec<_> = ctx
                    .bus()
                    .stats()
                    .subscriber_ids
                    .into_iter()
                    .filter(|id| *id != ctx.agent_id)
                    .collect();

                let delivered = recipients
                    .iter()
                    .filter(|recipient| {
                        ctx.send(
                            recipient,
                            json!({
                                "task_type": task.task_type(),
                                "task_id": task.id,
                                "message": request.message,
                            }),
                        )
                        .is_delivered()
                    })
                    .count();

                info!(agent = %ctx.agent_id, delivered, "Broadcast sent");
                Ok(json!({
                    "recipients": recipients.len(),
                    "delivered": delivered,
                }))
            }
            other => bail!("relay agent cannot handle task type {}", other.task_type()),
        }
    }
}

/// Logs every envelope and drops it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMessageHandler;

#[async_trait]
impl MessageHandler for LoggingMessageHandler {
    async fn handle(&self, envelope: MessageEnvelope, ctx: &AgentContext) {
        info!(
            agent = %ctx.agent_id,
            sender = %envelope.sender,
            message_id = %envelope.message_id,
            "Message received"
        );
    }
}

/// Logs and keeps every envelope it receives
#[derive(Debug, Default)]
pub struct RecordingMessageHandler {
    received: Mutex<Vec<MessageEnvelope>>,
}

impl RecordingMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_received(&self) -> MutexGuard<'_, Vec<MessageEnvelope>> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn received(&self) -> Vec<MessageEnvelope> {
        self.lock_received().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingMessageHandler {
    async fn handle(&self, envelope: MessageEnvelope, ctx: &AgentContext) {
        info!(
            agent = %ctx.agent_id,
            sender = %envelope.sender,
            message_id = %envelope.message_id,
            "Message received"
        );
        self.lock_received().push(envelope);
    }
}
