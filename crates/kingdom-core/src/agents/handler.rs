//! Handler traits consumed by agent workers
//!
//! Business logic lives behind these traits; the worker only drives them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::Result;
use crate::bus::{Delivery, MessageBus, MessageEnvelope};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::task::{AgentId, Task};

/// Executes tasks taken by a worker
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one task and return its result
    async fn handle(&self, task: &Task, ctx: &AgentContext) -> anyhow::Result<JsonValue>;

    /// Called once before the worker starts taking tasks
    async fn on_start(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reacts to envelopes arriving in an agent's mailbox
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope, ctx: &AgentContext);
}

/// Everything a handler may touch while running on behalf of an agent
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub agent_type: String,
    bus: Arc<MessageBus>,
    pool: ConnectionPool,
    acquire_timeout: Duration,
}

impl AgentContext {
    pub fn new(
        agent_id: AgentId,
        agent_type: impl Into<String>,
        bus: Arc<MessageBus>,
        pool: ConnectionPool,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            agent_id,
            agent_type: agent_type.into(),
            bus,
            pool,
            acquire_timeout,
        }
    }

    /// Send a message from this agent to `recipient`
    pub fn send(&self, recipient: &AgentId, payload: JsonValue) -> Delivery {
        self.bus.send(&self.agent_id, recipient, payload)
    }

    /// Lease a database connection for the duration of one task
    pub async fn connection(&self) -> Result<PooledConnection> {
        self.pool.acquire(self.acquire_timeout).await
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Handlers that make up one agent type
#[derive(Clone)]
pub struct AgentSpec {
    pub task_handler: Arc<dyn TaskHandler>,
    pub message_handler: Arc<dyn MessageHandler>,
}

impl AgentSpec {
    pub fn new(task_handler: Arc<dyn TaskHandler>, message_handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            task_handler,
            message_handler,
        }
    }

    /// Spec whose mailbox traffic is only logged
    pub fn with_task_handler(task_handler: Arc<dyn TaskHandler>) -> Self {
        Self::new(task_handler, Arc::new(super::default::LoggingMessageHandler))
    }
}
