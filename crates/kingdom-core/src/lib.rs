//! kingdom-core: Multi-agent task orchestration core
//!
//! Agent workers pull typed tasks from a shared queue, run them through
//! pluggable handlers and exchange notifications over an in-process message
//! bus. A supervisor owns the workers, the database connection pool and the
//! routing of tasks to agents.

pub mod agents;
pub mod bus;
pub mod config;
pub mod error;
pub mod pool;
pub mod router;
pub mod supervisor;
pub mod task;

pub use agents::{AgentContext, AgentSpec, AgentStatus, MessageHandler, TaskHandler};
pub use bus::{Delivery, MessageBus, MessageEnvelope, MessageStats};
pub use config::{DatabaseConfig, DispatchMode, ServiceConfig, TimingConfig};
pub use error::{Error, Result};
pub use pool::{ConnectionFactory, ConnectionPool, PoolStats, PooledConnection, SqliteConnector};
pub use router::TaskRouter;
pub use supervisor::{ServiceSnapshot, ServiceStatus, Supervisor};
pub use task::{AgentId, QueueStats, Task, TaskId, TaskKind, TaskOutcome, TaskPayload, TaskQueue};
