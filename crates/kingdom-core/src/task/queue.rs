//! Task Queue
//!
//! Shared FIFO of pending tasks plus optional per-agent inboxes used by
//! direct dispatch. Outcomes are kept in [`ResultTables`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::results::ResultTables;
use super::types::{AgentId, Task, TaskId, TaskOutcome};
use crate::{Error, Result};

/// Unbounded FIFO with an async, timeout-bounded pop
///
/// Producers never block. Consumers park on a [`Notify`] instead of
/// sleeping between polls.
pub struct WaitQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the tail and wake one waiting consumer
    pub fn push(&self, item: T) {
        self.lock_items().push_back(item);
        self.notify.notify_one();
    }

    /// Pop the head without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock_items().pop_front()
    }

    /// Pop the head, waiting up to `timeout` for an item to arrive
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    /// Remove every queued item
    pub fn drain(&self) -> Vec<T> {
        self.lock_items().drain(..).collect()
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting in the shared queue and all agent inboxes
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Shared task queue with write-once result tables
pub struct TaskQueue {
    shared: WaitQueue<Task>,
    inboxes: DashMap<AgentId, Arc<WaitQueue<Task>>>,
    results: ResultTables,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            shared: WaitQueue::new(),
            inboxes: DashMap::new(),
            results: ResultTables::new(),
        }
    }

    /// Append a task to the shared queue
    pub fn submit(&self, task: Task) {
        debug!(task_id = %task.id, task_type = task.task_type(), "Task queued");
        self.shared.push(task);
    }

    /// Take the head of the shared queue, waiting up to `timeout`
    pub async fn take(&self, timeout: Duration) -> Option<Task> {
        self.shared.pop_timeout(timeout).await
    }

    /// Create a private inbox for `agent_id`
    ///
    /// Once an inbox exists, [`TaskQueue::take_for`] reads from it instead of
    /// the shared queue.
    pub fn register_inbox(&self, agent_id: &AgentId) {
        self.inboxes
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(WaitQueue::new()));
    }

    /// Remove an agent's inbox, returning whatever was still queued in it
    pub fn unregister_inbox(&self, agent_id: &AgentId) -> Vec<Task> {
        self.inboxes
            .remove(agent_id)
            .map(|(_, inbox)| inbox.drain())
            .unwrap_or_default()
    }

    /// Push a task straight into the inbox of `agent_id`
    pub fn submit_direct(&self, agent_id: &AgentId, task: Task) -> Result<()> {
        let inbox = self
            .inboxes
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;

        debug!(task_id = %task.id, agent = %agent_id, "Task queued to agent inbox");
        inbox.push(task);
        Ok(())
    }

    /// Take the next task for `agent_id`
    ///
    /// Reads the agent's inbox when one is registered, the shared queue
    /// otherwise.
    pub async fn take_for(&self, agent_id: &AgentId, timeout: Duration) -> Option<Task> {
        let inbox = self
            .inboxes
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()));

        match inbox {
            Some(inbox) => inbox.pop_timeout(timeout).await,
            None => self.take(timeout).await,
        }
    }

    /// Record a successful result. Returns `false` if the task already ended.
    pub fn mark_completed(&self, task_id: &TaskId, result: JsonValue) -> bool {
        self.results.record(task_id, TaskOutcome::completed(result))
    }

    /// Record a failure. Returns `false` if the task already ended.
    pub fn mark_failed(&self, task_id: &TaskId, error: impl Into<String>) -> bool {
        self.results.record(task_id, TaskOutcome::failed(error))
    }

    pub fn outcome(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        self.results.get(task_id)
    }

    /// Wait until `task_id` has an outcome or `timeout` elapses
    pub async fn wait_for(&self, task_id: &TaskId, timeout: Duration) -> Option<TaskOutcome> {
        self.results.wait_for(task_id, timeout).await
    }

    pub fn stats(&self) -> QueueStats {
        let inbox_pending: usize = self.inboxes.iter().map(|entry| entry.value().len()).sum();
        let (completed, failed) = self.results.counts();

        QueueStats {
            pending: self.shared.len() + inbox_pending,
            completed,
            failed,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::TaskPayload;
    use serde_json::json;

    fn echo(text: &str) -> Task {
        Task::new(TaskPayload::echo(text))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        let tasks: Vec<Task> = (0..5).map(|i| echo(&i.to_string())).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();

        for task in tasks {
            queue.submit(task);
        }

        let mut taken = Vec::new();
        while let Some(task) = queue.take(Duration::from_millis(10)).await {
            taken.push(task.id);
        }
        assert_eq!(taken, ids);
    }

    #[tokio::test]
    async fn test_take_times_out_when_empty() {
        let queue = TaskQueue::new();
        let start = Instant::now();
        assert!(queue.take(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_take_wakes_on_submit() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = echo("late");
        let id = task.id.clone();
        queue.submit(task);

        let taken = consumer.await.unwrap().expect("task should arrive");
        assert_eq!(taken.id, id);
    }

    #[tokio::test]
    async fn test_parked_take_is_woken() {
        let queue = TaskQueue::new();
        let mut take = tokio_test::task::spawn(queue.take(Duration::from_secs(5)));
        tokio_test::assert_pending!(take.poll());

        queue.submit(echo("wake"));
        assert!(take.is_woken());
        let task = tokio_test::assert_ready!(take.poll());
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn test_each_task_taken_once() {
        let queue = Arc::new(TaskQueue::new());
        for i in 0..100 {
            queue.submit(echo(&i.to_string()));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(task) = queue.take(Duration::from_millis(20)).await {
                    seen.push(task.id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 100);
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn test_write_once_results() {
        let queue = TaskQueue::new();
        let id = TaskId::new("t1");

        assert!(queue.mark_completed(&id, json!("first")));
        assert!(!queue.mark_completed(&id, json!("second")));
        assert!(!queue.mark_failed(&id, "late failure"));

        match queue.outcome(&id) {
            Some(TaskOutcome::Completed { result, .. }) => assert_eq!(result, json!("first")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_direct_inbox() {
        let queue = TaskQueue::new();
        let agent = AgentId::new("echo_001");
        let other = AgentId::new("echo_002");

        assert!(matches!(
            queue.submit_direct(&agent, echo("x")),
            Err(Error::UnknownAgent(_))
        ));

        queue.register_inbox(&agent);
        queue.submit_direct(&agent, echo("x")).unwrap();
        assert_eq!(queue.stats().pending, 1);

        // An agent without an inbox reads the shared queue, which is empty
        assert!(queue.take_for(&other, Duration::from_millis(10)).await.is_none());
        assert!(queue.take_for(&agent, Duration::from_millis(10)).await.is_some());

        queue.submit_direct(&agent, echo("y")).unwrap();
        let leftover = queue.unregister_inbox(&agent);
        assert_eq!(leftover.len(), 1);
        assert_eq!(queue.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_wait_for_outcome() {
        let queue = Arc::new(TaskQueue::new());
        let id = TaskId::new("t2");

        let writer = {
            let queue = Arc::clone(&queue);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                queue.mark_failed(&id, "boom");
            })
        };

        let outcome = queue.wait_for(&id, Duration::from_secs(5)).await;
        writer.await.unwrap();
        assert!(matches!(outcome, Some(TaskOutcome::Failed { ref error, .. }) if error == "boom"));
        assert_eq!(queue.stats().failed, 1);
    }
}
