//! Agent status and registration types
//!
//! - AgentStatus: lifecycle state of a worker
//! - AgentState: live state written only by the owning worker
//! - AgentRegistration: the supervisor's copy used for routing
//! - AgentSnapshot: serialisable view for status reports

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{AgentId, TaskId};

/// Lifecycle state of an agent worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Created,
    Initialized,
    Idle,
    Busy,
    Error,
    Stopped,
}

impl AgentStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Initialized => 1,
            Self::Idle => 2,
            Self::Busy => 3,
            Self::Error => 4,
            Self::Stopped => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Idle,
            3 => Self::Busy,
            4 => Self::Error,
            5 => Self::Stopped,
            _ => Self::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Live worker state
///
/// Only the worker that owns it writes; everyone else reads.
#[derive(Debug, Default)]
pub struct AgentState {
    status: AtomicU8,
    task_count: AtomicU64,
    failed_count: AtomicU64,
    current_task: Mutex<Option<TaskId>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<TaskId>> {
        self.current_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_started(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: AgentStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Acquire)
    }

    /// Tasks whose handler returned an error or panicked
    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Acquire)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.lock_current().clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.lock_started()
    }

    /// Record the start of the run loop
    pub fn mark_started(&self) {
        *self.lock_started() = Some(Utc::now());
    }

    /// Enter `busy` for `task_id`
    pub fn begin_task(&self, task_id: &TaskId) {
        *self.lock_current() = Some(task_id.clone());
        self.task_count.fetch_add(1, Ordering::AcqRel);
        self.set_status(AgentStatus::Busy);
    }

    /// Leave `busy`, passing through `error` when the task failed
    pub fn finish_task(&self, succeeded: bool) {
        if !succeeded {
            self.failed_count.fetch_add(1, Ordering::AcqRel);
            self.set_status(AgentStatus::Error);
        }
        *self.lock_current() = None;
        self.set_status(AgentStatus::Idle);
    }
}

/// Supervisor-side record of a running agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub task_count: u64,
    pub failed_count: u64,
    pub current_task: Option<TaskId>,
    pub started_at: Option<DateTime<Utc>>,
}

impl AgentRegistration {
    pub fn new(agent_id: AgentId, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id,
            agent_type: agent_type.into(),
            status: AgentStatus::Created,
            task_count: 0,
            failed_count: 0,
            current_task: None,
            started_at: None,
        }
    }

    /// Copy the live values reported by the worker
    pub fn refresh_from(&mut self, state: &AgentState) {
        self.status = state.status();
        self.task_count = state.task_count();
        self.failed_count = state.failed_count();
        self.current_task = state.current_task();
        self.started_at = state.started_at();
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> AgentSnapshot {
        let uptime_seconds = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        AgentSnapshot {
            agent_type: self.agent_type.clone(),
            status: self.status,
            task_count: self.task_count,
            failed_count: self.failed_count,
            current_task: self.current_task.clone(),
            uptime_seconds,
        }
    }
}

/// Serialisable view of one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub agent_type: String,
    pub status: AgentStatus,
    pub task_count: u64,
    pub failed_count: u64,
    pub current_task: Option<TaskId>,
    pub uptime_seconds: f64,
}
