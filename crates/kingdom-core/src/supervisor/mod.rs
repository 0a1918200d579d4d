//! Service supervision
//!
//! ```text
//! ┌──────────────────────────── Supervisor ────────────────────────────┐
//! │  TaskRouter ── submit ──▶ TaskQueue ──▶ AgentWorker × N            │
//! │                              ▲            │        ▲               │
//! │                  results ────┘            ▼        │ mailbox       │
//! │                                    ConnectionPool  MessageBus      │
//! │  Monitor: refreshes registrations, logs a periodic summary         │
//! └────────────────────────────────────────────────────────────────────┘
//! ```

pub mod monitor;
pub mod service;
pub mod status;

pub use monitor::{AgentRegistry, MonitorHandle};
pub use service::Supervisor;
pub use status::{ServiceSnapshot, ServiceStatus};
