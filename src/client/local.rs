use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::client::MessageQueue;
use crate::core::{BrokerError, Lifecycle, Message, Queue};

/// Handle onto a queue of an engine in the same process.
///
/// Stays valid across `stop`; every call fails once the engine has been
/// destroyed.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    queue: Arc<Queue>,
    lifecycle: Arc<Lifecycle>,
}

impl LocalQueue {
    pub(crate) fn new(queue: Arc<Queue>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { queue, lifecycle }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Keys that have a mailbox in this queue.
    pub fn keys(&self) -> Result<Vec<String>, BrokerError> {
        self.lifecycle.ensure_usable("keys")?;
        Ok(self.queue.keys())
    }

    /// Messages currently queued for `key`.
    pub fn depth(&self, key: &str) -> Result<usize, BrokerError> {
        self.lifecycle.ensure_usable("depth")?;
        Ok(self.queue.mailbox(key).len())
    }

    /// Drops the mailbox for `key`, returning what it still held.
    pub fn remove_key(&self, key: &str) -> Result<Vec<Message>, BrokerError> {
        self.lifecycle.ensure_usable("remove_key")?;
        Ok(self.queue.remove_key(key))
    }
}

impl MessageQueue for LocalQueue {
    type Error = BrokerError;

    fn push(&self, key: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.lifecycle.ensure_usable("push")?;
        self.queue.push(key, payload)
    }

    fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        self.lifecycle.ensure_usable("pop")?;
        Ok(self.queue.pop(key, timeout))
    }
}
