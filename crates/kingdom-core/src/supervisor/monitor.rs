//! Agent registry and periodic monitor
//!
//! The registry holds the supervisor's copy of every agent registration next
//! to the live state its worker writes. The monitor refreshes those copies
//! and logs a periodic summary.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agents::{AgentRegistration, AgentSnapshot, AgentState, AgentStatus};
use crate::bus::MessageBus;
use crate::task::{AgentId, TaskQueue};

struct Entry {
    registration: AgentRegistration,
    state: Arc<AgentState>,
}

/// Registration table keyed (and ordered) by agent id
#[derive(Default)]
pub struct AgentRegistry {
    entries: Mutex<BTreeMap<AgentId, Entry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<AgentId, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, registration: AgentRegistration, state: Arc<AgentState>) {
        self.lock_entries().insert(
            registration.agent_id.clone(),
            Entry {
                registration,
                state,
            },
        );
    }

    /// Copy live worker state into every registration
    pub fn refresh(&self) {
        for entry in self.lock_entries().values_mut() {
            entry.registration.refresh_from(&entry.state);
        }
    }

    /// Current registrations, ordered by agent id
    pub fn table(&self) -> BTreeMap<AgentId, AgentRegistration> {
        self.lock_entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.registration.clone()))
            .collect()
    }

    pub fn snapshots(&self) -> BTreeMap<AgentId, AgentSnapshot> {
        let now = Utc::now();
        self.lock_entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.registration.snapshot(now)))
            .collect()
    }

    pub fn mark_all_stopped(&self) {
        for entry in self.lock_entries().values_mut() {
            entry.registration.status = AgentStatus::Stopped;
            entry.registration.current_task = None;
        }
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn count(&self, status: AgentStatus) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| entry.registration.status == status)
            .count()
    }
}

/// Running monitor task
pub struct MonitorHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
    }
}

/// Shared handles the monitor reads from
pub struct MonitorTargets {
    pub service_name: String,
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<MessageBus>,
}

/// Start the monitor loop
///
/// Registrations are refreshed every `interval`; a summary is logged every
/// `log_interval`.
pub fn spawn_monitor(targets: MonitorTargets, interval: Duration, log_interval: Duration) -> MonitorHandle {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let mut refresh = tokio::time::interval(interval);
        let mut summary =
            tokio::time::interval_at(tokio::time::Instant::now() + log_interval, log_interval);

        debug!("Monitor started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = refresh.tick() => targets.registry.refresh(),
                _ = summary.tick() => log_summary(&targets),
            }
        }
        debug!("Monitor stopped");
    });

    MonitorHandle {
        shutdown_tx,
        handle,
    }
}

fn log_summary(targets: &MonitorTargets) {
    let queue = targets.queue.stats();
    let bus = targets.bus.stats();
    let registry = &targets.registry;

    info!(
        service = %targets.service_name,
        agents = registry.len(),
        idle = registry.count(AgentStatus::Idle),
        busy = registry.count(AgentStatus::Busy),
        pending = queue.pending,
        completed = queue.completed,
        failed = queue.failed,
        messages = bus.total_messages,
        "Service status"
    );
}
