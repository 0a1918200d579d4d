//! Error types for kingdom-core

use std::time::Duration;

use thiserror::Error;

/// Main error type for kingdom-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("No agents available for task type: {task_type}")]
    NoAgentsAvailable { task_type: String },

    #[error("Agent not found: {0}")]
    UnknownAgent(String),

    #[error("Task {task_id} failed: {message}")]
    Handler { task_id: String, message: String },

    #[error("Task {task_id} timed out after {waited:?}")]
    Timeout { task_id: String, waited: Duration },

    #[error("No database connection available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Failed to initialize connection pool: {0}")]
    PoolInit(String),

    #[error("Failed to start agent {agent_id}: {message}")]
    AgentStart { agent_id: String, message: String },

    #[error("Invalid payload for task type {task_type}: {message}")]
    InvalidPayload { task_type: String, message: String },

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error describes a caller giving up rather than the task failing
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for kingdom-core
pub type Result<T> = std::result::Result<T, Error>;
