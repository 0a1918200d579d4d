//! Agent workers
//!
//! An agent is a worker loop bound to an agent type. The handlers for each
//! type are supplied by the embedding application through [`AgentSpec`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kingdom_core::agents::{AgentSpec, EchoHandler};
//! use kingdom_core::{ServiceConfig, Supervisor, TaskPayload};
//! use std::sync::Arc;
//!
//! let mut supervisor = Supervisor::new(ServiceConfig::default())?;
//! supervisor.register_agent_type("echo", AgentSpec::with_task_handler(Arc::new(EchoHandler)));
//! supervisor.start().await?;
//!
//! let id = supervisor.submit_task(TaskPayload::echo("hi"), None, None)?;
//! let result = supervisor.wait_for_result(&id, Duration::from_secs(5)).await?;
//! ```

pub mod default;
pub mod handler;
pub mod types;
pub mod worker;

pub use default::{EchoHandler, LoggingMessageHandler, RecordingMessageHandler, RelayHandler};
pub use handler::{AgentContext, AgentSpec, MessageHandler, TaskHandler};
pub use types::{AgentRegistration, AgentSnapshot, AgentState, AgentStatus};
pub use worker::{AgentWorker, WorkerTiming};
