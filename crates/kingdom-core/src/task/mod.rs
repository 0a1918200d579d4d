//! Task model and queueing
//!
//! ```text
//! submit ──▶ TaskQueue (shared FIFO | per-agent inbox) ──▶ worker
//!                                                           │
//!            ResultTables (completed / failed) ◀────────────┘
//! ```

pub mod queue;
pub mod results;
pub mod types;

pub use queue::{QueueStats, TaskQueue, WaitQueue};
pub use results::ResultTables;
pub use types::{
    A2aRequest, AgentId, BroadcastRequest, ChatRequest, DEFAULT_PRIORITY, EchoRequest,
    MathRequest, RecordDelete, RecordInsert, RecordQuery, RecordUpdate, Task, TaskId, TaskKind,
    TaskOutcome, TaskPayload,
};
