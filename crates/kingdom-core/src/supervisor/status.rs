//! Service status reporting

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::agents::AgentSnapshot;
use crate::bus::MessageStats;
use crate::pool::PoolStats;
use crate::task::{AgentId, QueueStats};

/// Lifecycle state of the whole service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// Whether `start()` may run from this state
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub service_status: ServiceStatus,
    pub agents: BTreeMap<AgentId, AgentSnapshot>,
    pub task_queue: QueueStats,
    pub a2a_messages: MessageStats,
    pub database_pool: PoolStats,
}

impl ServiceSnapshot {
    /// Number of agents currently in `status`
    pub fn count_agents(&self, status: crate::agents::AgentStatus) -> usize {
        self.agents
            .values()
            .filter(|agent| agent.status == status)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_start() {
        assert!(ServiceStatus::Stopped.can_start());
        assert!(ServiceStatus::Error.can_start());
        assert!(!ServiceStatus::Running.can_start());
        assert!(!ServiceStatus::Starting.can_start());
        assert!(!ServiceStatus::Stopping.can_start());
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = ServiceSnapshot {
            service_name: "Kingdom Agent Service".to_string(),
            service_status: ServiceStatus::Running,
            agents: BTreeMap::new(),
            task_queue: QueueStats::default(),
            a2a_messages: MessageStats::default(),
            database_pool: PoolStats::default(),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["service_status"], "running");
        assert_eq!(value["task_queue"]["pending"], 0);
        assert!(value["database_pool"]["connections_created"].is_number());
    }
}
