//! Agent worker run loop
//!
//! Each worker waits on three sources at once: the shutdown signal, the
//! task queue and its own mailbox. Tasks run one at a time; a handler error
//! or panic is recorded as a task failure and never ends the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{AgentContext, AgentSpec};
use super::types::{AgentState, AgentStatus};
use crate::config::TimingConfig;
use crate::bus::MessageEnvelope;
use crate::task::{AgentId, Task, TaskQueue};
use crate::{Error, Result};

/// Poll intervals used by a worker
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub task_poll_interval: Duration,
    pub mailbox_poll_interval: Duration,
    pub requeue_backoff: Duration,
}

impl From<&TimingConfig> for WorkerTiming {
    fn from(config: &TimingConfig) -> Self {
        Self {
            task_poll_interval: config.task_poll_interval(),
            mailbox_poll_interval: config.mailbox_poll_interval(),
            requeue_backoff: config.requeue_backoff(),
        }
    }
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

/// One agent's run loop
pub struct AgentWorker {
    ctx: AgentContext,
    spec: AgentSpec,
    queue: Arc<TaskQueue>,
    state: Arc<AgentState>,
    timing: WorkerTiming,
}

impl AgentWorker {
    pub fn new(ctx: AgentContext, spec: AgentSpec, queue: Arc<TaskQueue>, timing: WorkerTiming) -> Self {
        Self {
            ctx,
            spec,
            queue,
            state: Arc::new(AgentState::new()),
            timing,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.ctx.agent_id
    }

    /// Shared handle to the state this worker reports
    pub fn state(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    /// Run the task handler's start hook
    pub async fn initialize(&self) -> Result<()> {
        self.spec
            .task_handler
            .on_start(&self.ctx)
            .await
            .map_err(|e| {
                self.state.set_status(AgentStatus::Error);
                Error::AgentStart {
                    agent_id: self.ctx.agent_id.to_string(),
                    message: format!("{:#}", e),
                }
            })?;

        self.state.set_status(AgentStatus::Initialized);
        Ok(())
    }

    /// Spawn the run loop on the runtime
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Loop until shutdown is signalled
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let agent_id = self.ctx.agent_id.clone();
        self.state.mark_started();
        self.state.set_status(AgentStatus::Idle);
        info!(agent = %agent_id, agent_type = %self.ctx.agent_type, "Agent started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    debug!(agent = %agent_id, "Shutdown requested");
                    break;
                }
                task = self.queue.take_for(&agent_id, self.timing.task_poll_interval) => {
                    if let Some(task) = task {
                        self.process(task).await;
                    }
                }
                envelope = self.next_message() => {
                    if let Some(envelope) = envelope {
                        self.dispatch_message(envelope).await;
                    }
                }
            }
        }

        self.state.set_status(AgentStatus::Stopped);
        info!(
            agent = %agent_id,
            tasks = self.state.task_count(),
            failed = self.state.failed_count(),
            "Agent stopped"
        );
    }

    async fn next_message(&self) -> Option<MessageEnvelope> {
        if !self.ctx.bus().is_subscribed(&self.ctx.agent_id) {
            // Without a mailbox receive returns at once; pace the loop instead
            tokio::time::sleep(self.timing.mailbox_poll_interval).await;
            return None;
        }
        self.ctx
            .bus()
            .receive(&self.ctx.agent_id, self.timing.mailbox_poll_interval)
            .await
    }

    async fn process(&self, task: Task) {
        if !task.is_for(&self.ctx.agent_id) {
            debug!(
                agent = %self.ctx.agent_id,
                task_id = %task.id,
                pinned = ?task.agent_id,
                "Task pinned to another agent, requeueing"
            );
            self.queue.submit(task);
            tokio::time::sleep(self.timing.requeue_backoff).await;
            return;
        }

        self.state.begin_task(&task.id);
        debug!(agent = %self.ctx.agent_id, task_id = %task.id, task_type = task.task_type(), "Task started");

        let outcome = AssertUnwindSafe(self.spec.task_handler.handle(&task, &self.ctx))
            .catch_unwind()
            .await;

        let succeeded = match outcome {
            Ok(Ok(result)) => {
                self.queue.mark_completed(&task.id, result);
                info!(agent = %self.ctx.agent_id, task_id = %task.id, "Task completed");
                true
            }
            Ok(Err(e)) => {
                warn!(agent = %self.ctx.agent_id, task_id = %task.id, error = %e, "Task failed");
                self.queue.mark_failed(&task.id, format!("{:#}", e));
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(agent = %self.ctx.agent_id, task_id = %task.id, panic = %message, "Task handler panicked");
                self.queue
                    .mark_failed(&task.id, format!("handler panicked: {}", message));
                false
            }
        };

        self.state.finish_task(succeeded);
    }

    async fn dispatch_message(&self, envelope: MessageEnvelope) {
        let message_id = envelope.message_id.clone();
        let handled = AssertUnwindSafe(self.spec.message_handler.handle(envelope, &self.ctx))
            .catch_unwind()
            .await;

        if let Err(panic) = handled {
            error!(
                agent = %self.ctx.agent_id,
                message_id = %message_id,
                panic = %panic_message(panic.as_ref()),
                "Message handler panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
