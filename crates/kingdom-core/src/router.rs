//! Task Router
//!
//! Maps task types to agent types and picks a concrete agent from the
//! registration table, preferring idle agents of the target type.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::agents::AgentRegistration;
use crate::config::ServiceConfig;
use crate::task::{AgentId, TaskKind};
use crate::{Error, Result};

/// Agent type serving each known task type
fn default_agent_type(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Echo => "echo",
        TaskKind::ProcessChatMessage => "general_receiver",
        TaskKind::SolveMathProblem => "math_calculator",
        TaskKind::DbInsert | TaskKind::DbRead | TaskKind::DbUpdate | TaskKind::DbDelete => {
            "tester1"
        }
        TaskKind::TestA2aCommunication
        | TaskKind::SendBroadcastTest
        | TaskKind::ValidateCommunication
        | TaskKind::SendTestMessage => "tester2",
    }
}

/// Task-type to agent-type routing
#[derive(Debug, Clone)]
pub struct TaskRouter {
    routes: HashMap<String, String>,
    fallback_agent_type: String,
}

impl TaskRouter {
    /// Router with the built-in table and the given fallback agent type
    pub fn new(fallback_agent_type: impl Into<String>) -> Self {
        let routes = TaskKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), default_agent_type(*kind).to_string()))
            .collect();

        Self {
            routes,
            fallback_agent_type: fallback_agent_type.into(),
        }
    }

    /// Built-in table with the overrides and fallback from configuration
    pub fn from_config(config: &ServiceConfig) -> Self {
        config
            .routes
            .iter()
            .fold(Self::new(&config.fallback_agent_type), |router, (task_type, agent_type)| {
                router.with_route(task_type, agent_type)
            })
    }

    /// Add or replace a route
    pub fn with_route(mut self, task_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        self.routes.insert(task_type.into(), agent_type.into());
        self
    }

    pub fn fallback_agent_type(&self) -> &str {
        &self.fallback_agent_type
    }

    /// Agent type that should handle `task_type`
    pub fn target_agent_type(&self, task_type: &str) -> &str {
        self.routes
            .get(task_type)
            .map(String::as_str)
            .unwrap_or(self.fallback_agent_type.as_str())
    }

    /// Pick the agent for `task_type`
    ///
    /// Order of preference: an idle agent of the target type, any agent of
    /// the target type, any registered agent. Ties go to the lowest id.
    pub fn select_agent(
        &self,
        task_type: &str,
        registrations: &BTreeMap<AgentId, AgentRegistration>,
    ) -> Result<AgentId> {
        let target = self.target_agent_type(task_type);

        let of_target = move || {
            registrations
                .values()
                .filter(move |registration| registration.agent_type == target)
        };

        if let Some(registration) = of_target().find(|registration| registration.is_idle()) {
            debug!(task_type, agent = %registration.agent_id, "Routed to idle agent");
            return Ok(registration.agent_id.clone());
        }

        if let Some(registration) = of_target().next() {
            debug!(task_type, agent = %registration.agent_id, "No idle agent, routed to busy agent");
            return Ok(registration.agent_id.clone());
        }

        if let Some(registration) = registrations.values().next() {
            warn!(
                task_type,
                target_type = target,
                agent = %registration.agent_id,
                "No agent of target type, routed to first available agent"
            );
            return Ok(registration.agent_id.clone());
        }

        Err(Error::NoAgentsAvailable {
            task_type: task_type.to_string(),
        })
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new("tester1")
    }
}
