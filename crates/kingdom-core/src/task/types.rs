//! Task types
//!
//! Defines the unit of routed work:
//! - TaskId / AgentId: identifiers
//! - TaskPayload: typed payload keyed by task type
//! - Task: immutable work item travelling through the queue
//! - TaskOutcome: write-once record of how a task ended

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Priority assigned when the submitter does not pass one
pub const DEFAULT_PRIORITY: u8 = 5;

/// Unique identifier for a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        // v7 ids sort by creation time
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of an agent worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the `index`-th (1-based) worker of an agent type, e.g. `echo_001`
    pub fn numbered(agent_type: &str, index: usize) -> Self {
        Self(format!("{}_{:03}", agent_type, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Known task types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Echo,
    ProcessChatMessage,
    SolveMathProblem,
    DbInsert,
    DbRead,
    DbUpdate,
    DbDelete,
    TestA2aCommunication,
    SendTestMessage,
    SendBroadcastTest,
    ValidateCommunication,
}

impl TaskKind {
    pub const ALL: [TaskKind; 11] = [
        TaskKind::Echo,
        TaskKind::ProcessChatMessage,
        TaskKind::SolveMathProblem,
        TaskKind::DbInsert,
        TaskKind::DbRead,
        TaskKind::DbUpdate,
        TaskKind::DbDelete,
        TaskKind::TestA2aCommunication,
        TaskKind::SendTestMessage,
        TaskKind::SendBroadcastTest,
        TaskKind::ValidateCommunication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::ProcessChatMessage => "process_chat_message",
            Self::SolveMathProblem => "solve_math_problem",
            Self::DbInsert => "db_insert",
            Self::DbRead => "db_read",
            Self::DbUpdate => "db_update",
            Self::DbDelete => "db_delete",
            Self::TestA2aCommunication => "test_a2a_communication",
            Self::SendTestMessage => "send_test_message",
            Self::SendBroadcastTest => "send_broadcast_test",
            Self::ValidateCommunication => "validate_communication",
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownTaskType(s.to_string()))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo body; accepts `{"text": ...}` or a bare JSON string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EchoBody")]
pub struct EchoRequest {
    pub text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EchoBody {
    Text(String),
    Object { text: String },
}

impl From<EchoBody> for EchoRequest {
    fn from(body: EchoBody) -> Self {
        match body {
            EchoBody::Text(text) | EchoBody::Object { text } => Self { text },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathRequest {
    pub problem: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInsert {
    pub data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub record_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub record_id: i64,
    pub data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDelete {
    pub record_id: i64,
}

/// Agent-to-agent notification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2aRequest {
    pub target_agent: AgentId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

/// Typed task payload, one variant per task type
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Echo(EchoRequest),
    ProcessChatMessage(ChatRequest),
    SolveMathProblem(MathRequest),
    DbInsert(RecordInsert),
    DbRead(RecordQuery),
    DbUpdate(RecordUpdate),
    DbDelete(RecordDelete),
    TestA2aCommunication(A2aRequest),
    SendTestMessage(A2aRequest),
    SendBroadcastTest(BroadcastRequest),
    ValidateCommunication(A2aRequest),
    /// Task type the core does not know; routed through the fallback agent type
    Custom { task_type: String, body: JsonValue },
}

impl TaskPayload {
    pub fn echo(text: impl Into<String>) -> Self {
        Self::Echo(EchoRequest { text: text.into() })
    }

    pub fn custom(task_type: impl Into<String>, body: JsonValue) -> Self {
        Self::Custom {
            task_type: task_type.into(),
            body,
        }
    }

    /// Build a payload from an externally supplied task type and JSON body
    ///
    /// Unknown task types become [`TaskPayload::Custom`]; known types must
    /// carry a body of the matching shape.
    pub fn from_parts(task_type: &str, body: JsonValue) -> Result<Self> {
        let kind = match task_type.parse::<TaskKind>() {
            Ok(kind) => kind,
            Err(_) => return Ok(Self::custom(task_type, body)),
        };

        let invalid = |e: serde_json::Error| Error::InvalidPayload {
            task_type: task_type.to_string(),
            message: e.to_string(),
        };

        let payload = match kind {
            TaskKind::Echo => Self::Echo(serde_json::from_value(body).map_err(invalid)?),
            TaskKind::ProcessChatMessage => {
                Self::ProcessChatMessage(serde_json::from_value(body).map_err(invalid)?)
            }
            TaskKind::SolveMathProblem => {
                Self::SolveMathProblem(serde_json::from_value(body).map_err(invalid)?)
            }
            TaskKind::DbInsert => Self::DbInsert(serde_json::from_value(body).map_err(invalid)?),
            TaskKind::DbRead => Self::DbRead(serde_json::from_value(body).map_err(invalid)?),
            TaskKind::DbUpdate => Self::DbUpdate(serde_json::from_value(body).map_err(invalid)?),
            TaskKind::DbDelete => Self::DbDelete(serde_json::from_value(body).map_err(invalid)?),
            TaskKind::TestA2aCommunication => {
                Self::TestA2aCommunication(serde_json::from_value(body).map_err(invalid)?)
            }
            TaskKind::SendTestMessage => {
                Self::SendTestMessage(serde_json::from_value(body).map_err(invalid)?)
            }
            TaskKind::SendBroadcastTest => {
                Self::SendBroadcastTest(serde_json::from_value(body).map_err(invalid)?)
            }
            TaskKind::ValidateCommunication => {
                Self::ValidateCommunication(serde_json::from_value(body).map_err(invalid)?)
            }
        };

        Ok(payload)
    }

    /// Known kind, or `None` for custom payloads
    pub fn kind(&self) -> Option<TaskKind> {
        match self {
            Self::Echo(_) => Some(TaskKind::Echo),
            Self::ProcessChatMessage(_) => Some(TaskKind::ProcessChatMessage),
            Self::SolveMathProblem(_) => Some(TaskKind::SolveMathProblem),
            Self::DbInsert(_) => Some(TaskKind::DbInsert),
            Self::DbRead(_) => Some(TaskKind::DbRead),
            Self::DbUpdate(_) => Some(TaskKind::DbUpdate),
            Self::DbDelete(_) => Some(TaskKind::DbDelete),
            Self::TestA2aCommunication(_) => Some(TaskKind::TestA2aCommunication),
            Self::SendTestMessage(_) => Some(TaskKind::SendTestMessage),
            Self::SendBroadcastTest(_) => Some(TaskKind::SendBroadcastTest),
            Self::ValidateCommunication(_) => Some(TaskKind::ValidateCommunication),
            Self::Custom { .. } => None,
        }
    }

    /// Task type tag used for routing and logging
    pub fn task_type(&self) -> &str {
        match self {
            Self::Custom { task_type, .. } => task_type.as_str(),
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }

    /// Payload body as JSON
    pub fn body(&self) -> JsonValue {
        let value = match self {
            Self::Echo(req) => serde_json::to_value(req),
            Self::ProcessChatMessage(req) => serde_json::to_value(req),
            Self::SolveMathProblem(req) => serde_json::to_value(req),
            Self::DbInsert(req) => serde_json::to_value(req),
            Self::DbRead(req) => serde_json::to_value(req),
            Self::DbUpdate(req) => serde_json::to_value(req),
            Self::DbDelete(req) => serde_json::to_value(req),
            Self::TestA2aCommunication(req)
            | Self::SendTestMessage(req)
            | Self::ValidateCommunication(req) => serde_json::to_value(req),
            Self::SendBroadcastTest(req) => serde_json::to_value(req),
            Self::Custom { body, .. } => Ok(body.clone()),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

/// Unit of routed work
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Pinned recipient; `None` lets any worker take it
    pub agent_id: Option<AgentId>,
    /// Typed payload
    pub payload: TaskPayload,
    /// Carried for callers; the queue never reorders by it
    pub priority: u8,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: TaskId::default(),
            agent_id: None,
            payload,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
        }
    }

    /// Pin the task to one agent
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn task_type(&self) -> &str {
        self.payload.task_type()
    }

    /// Whether the worker `agent_id` may execute this task
    pub fn is_for(&self, agent_id: &AgentId) -> bool {
        self.agent_id.as_ref().is_none_or(|pinned| pinned == agent_id)
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        result: JsonValue,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl TaskOutcome {
    pub fn completed(result: JsonValue) -> Self {
        Self::Completed {
            result,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Convert a recorded business failure into [`Error::Handler`]
    pub fn into_result(self, task_id: &TaskId) -> Result<JsonValue> {
        match self {
            Self::Completed { result, .. } => Ok(result),
            Self::Failed { error, .. } => Err(Error::Handler {
                task_id: task_id.to_string(),
                message: error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_id_default() {
        let id1 = TaskId::default();
        let id2 = TaskId::default();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_agent_id_numbered() {
        assert_eq!(AgentId::numbered("tester1", 1).as_str(), "tester1_001");
        assert_eq!(AgentId::numbered("echo", 12).as_str(), "echo_012");
    }

    #[test]
    fn test_task_kind_from_str() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("summarize".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_payload_from_parts_known() {
        let payload = TaskPayload::from_parts("echo", json!({"text": "hi"})).unwrap();
        assert_eq!(payload, TaskPayload::echo("hi"));
        assert_eq!(payload.task_type(), "echo");
        assert_eq!(payload.kind(), Some(TaskKind::Echo));

        let payload = TaskPayload::from_parts("echo", json!("hi")).unwrap();
        assert_eq!(payload, TaskPayload::echo("hi"));
        assert!(TaskPayload::from_parts("echo", json!(42)).is_err());

        let payload =
            TaskPayload::from_parts("db_read", json!({"limit": 5})).unwrap();
        assert_eq!(
            payload,
            TaskPayload::DbRead(RecordQuery {
                record_id: None,
                limit: Some(5)
            })
        );
    }

    #[test]
    fn test_payload_from_parts_unknown_becomes_custom() {
        let payload = TaskPayload::from_parts("summarize", json!({"doc": 1})).unwrap();
        assert_eq!(payload.task_type(), "summarize");
        assert_eq!(payload.kind(), None);
        assert_eq!(payload.body(), json!({"doc": 1}));
    }

    #[test]
    fn test_payload_from_parts_malformed() {
        let result = TaskPayload::from_parts("db_delete", json!({"record": "x"}));
        assert!(matches!(
            result,
            Err(Error::InvalidPayload { ref task_type, .. }) if task_type == "db_delete"
        ));
    }

    #[test]
    fn test_payload_body() {
        let payload = TaskPayload::SendTestMessage(A2aRequest {
            target_agent: AgentId::new("tester2_001"),
            message: "hello".to_string(),
        });
        assert_eq!(
            payload.body(),
            json!({"target_agent": "tester2_001", "message": "hello"})
        );
    }

    #[test]
    fn test_task_defaults() {
        let task = Task::new(TaskPayload::echo("hi"));
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert!(task.agent_id.is_none());
        assert!(task.is_for(&AgentId::new("anyone")));
    }

    #[test]
    fn test_task_pinned() {
        let task = Task::new(TaskPayload::echo("hi"))
            .with_agent(AgentId::new("echo_001"))
            .with_priority(1);
        assert_eq!(task.priority, 1);
        assert!(task.is_for(&AgentId::new("echo_001")));
        assert!(!task.is_for(&AgentId::new("echo_002")));
    }

    #[test]
    fn test_outcome_into_result() {
        let id = TaskId::new("task-1");
        let ok = TaskOutcome::completed(json!("done"));
        assert!(ok.is_success());
        assert_eq!(ok.into_result(&id).unwrap(), json!("done"));

        let failed = TaskOutcome::failed("boom");
        assert!(!failed.is_success());
        match failed.into_result(&id) {
            Err(Error::Handler { task_id, message }) => {
                assert_eq!(task_id, "task-1");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
