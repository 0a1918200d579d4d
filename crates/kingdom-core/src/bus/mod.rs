//! Agent-to-agent messaging

pub mod envelope;
pub mod message_bus;

pub use envelope::{Delivery, MessageEnvelope};
pub use message_bus::{MessageBus, MessageStats};
