//! Completion and failure tables
//!
//! The first outcome recorded for a task id wins, across both tables.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::types::{TaskId, TaskOutcome};

#[derive(Default)]
struct Tables {
    completed: HashMap<TaskId, TaskOutcome>,
    failed: HashMap<TaskId, TaskOutcome>,
}

impl Tables {
    fn get(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.completed
            .get(task_id)
            .or_else(|| self.failed.get(task_id))
    }
}

/// Write-once outcome store with waiters
pub struct ResultTables {
    tables: Mutex<Tables>,
    changed: Notify,
}

impl ResultTables {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            changed: Notify::new(),
        }
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `outcome` unless the task already has one
    pub fn record(&self, task_id: &TaskId, outcome: TaskOutcome) -> bool {
        {
            let mut tables = self.lock_tables();
            if tables.get(task_id).is_some() {
                warn!(task_id = %task_id, "Outcome already recorded, ignoring later write");
                return false;
            }

            let table = if outcome.is_success() {
                &mut tables.completed
            } else {
                &mut tables.failed
            };
            table.insert(task_id.clone(), outcome);
        }

        self.changed.notify_waiters();
        true
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        self.lock_tables().get(task_id).cloned()
    }

    /// (completed, failed)
    pub fn counts(&self) -> (usize, usize) {
        let tables = self.lock_tables();
        (tables.completed.len(), tables.failed.len())
    }

    pub async fn wait_for(&self, task_id: &TaskId, timeout: Duration) -> Option<TaskOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.get(task_id) {
                return Some(outcome);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(task_id);
            }
        }
    }
}

impl Default for ResultTables {
    fn default() -> Self {
        Self::new()
    }
}
