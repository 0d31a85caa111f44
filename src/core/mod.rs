//! Broker state: messages, per-key mailboxes, queues and the registry.

pub mod error;
pub mod lifecycle;
pub mod mailbox;
pub mod message;
pub mod queue;
pub mod registry;

pub use error::BrokerError;
pub use lifecycle::{EngineState, Lifecycle};
pub use mailbox::{Mailbox, PopOutcome, Ticket};
pub use message::Message;
pub use queue::{Queue, QueueLimits};
pub use registry::QueueRegistry;
