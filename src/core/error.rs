use thiserror::Error;

use crate::core::lifecycle::EngineState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("operation `{operation}` is not valid while the engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("mailbox `{key}` is full ({capacity} messages)")]
    QueueFull { key: String, capacity: usize },

    #[error("message for `{key}` needs a {size} byte frame, limit is {max}")]
    MessageTooLarge { key: String, size: usize, max: u32 },

    #[error("key of {len} bytes is longer than 65535")]
    KeyTooLong { len: usize },

    #[error("mailbox `{key}` was removed from its queue")]
    KeyRemoved { key: String },

    #[error("engine I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io(err.to_string())
    }
}
