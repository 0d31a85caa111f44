//! Named queue: a topic store mapping keys to mailboxes.
//!
//! Mailboxes are created on first reference and live as long as the queue,
//! unless explicitly removed with [`Queue::remove_key`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::core::error::BrokerError;
use crate::core::lifecycle::Lifecycle;
use crate::core::mailbox::{Mailbox, PopOutcome};
use crate::core::message::Message;
use crate::protocol::{message_frame_len, DEFAULT_MAX_FRAME_LEN};

/// Bounds shared by every mailbox of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Messages per mailbox; `None` is unbounded.
    pub max_depth: Option<usize>,
    /// Largest frame the wire accepts. A message whose MESSAGE reply would
    /// not fit is refused at push time, so every stored message can be
    /// delivered.
    pub max_frame_len: u32,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    mailboxes: DashMap<String, Arc<Mailbox>>,
    limits: QueueLimits,
    lifecycle: Arc<Lifecycle>,
}

impl Queue {
    pub fn new(name: impl Into<String>, limits: QueueLimits, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            name: name.into(),
            mailboxes: DashMap::new(),
            limits,
            lifecycle,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the mailbox for `key`, creating it if needed.
    pub fn mailbox(&self, key: &str) -> Arc<Mailbox> {
        if let Some(existing) = self.mailboxes.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.mailboxes.entry(key.to_owned()).or_insert_with(|| {
            debug!(queue = %self.name, key, "creating mailbox");
            Arc::new(Mailbox::new(
                key,
                self.limits.max_depth,
                Arc::clone(&self.lifecycle),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn push(&self, key: &str, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        self.push_message(Message::new(key, payload))
    }

    pub fn push_message(&self, mut message: Message) -> Result<(), BrokerError> {
        self.check_deliverable(&message)?;
        // A concurrent remove_key can detach the mailbox between lookup and
        // deposit; the message then comes back and goes to the fresh one.
        loop {
            let mailbox = self.mailbox(message.key());
            match mailbox.deposit(message)? {
                None => return Ok(()),
                Some(returned) => message = returned,
            }
        }
    }

    fn check_deliverable(&self, message: &Message) -> Result<(), BrokerError> {
        let key_len = message.key().len();
        if key_len > usize::from(u16::MAX) {
            return Err(BrokerError::KeyTooLong { len: key_len });
        }
        let size = message_frame_len(message);
        if size > self.limits.max_frame_len as usize {
            return Err(BrokerError::MessageTooLarge {
                key: message.key().to_string(),
                size,
                max: self.limits.max_frame_len,
            });
        }
        Ok(())
    }

    /// Blocking pop for in-process consumers. `Duration::ZERO` polls.
    pub fn pop(&self, key: &str, timeout: Duration) -> Option<Message> {
        self.mailbox(key).pop(timeout)
    }

    /// Non-blocking form used by the worker threads: either returns a
    /// message now or parks `complete` on the mailbox.
    pub fn pop_or_wait<F>(&self, key: &str, wait: bool, complete: F) -> (Arc<Mailbox>, PopOutcome)
    where
        F: FnOnce(Option<Message>) + Send + 'static,
    {
        let mailbox = self.mailbox(key);
        let outcome = mailbox.pop_or_wait(wait, complete);
        (mailbox, outcome)
    }

    /// Returns an undelivered message to the head of its mailbox.
    pub fn requeue(&self, mut message: Message) {
        loop {
            let mailbox = self.mailbox(message.key());
            match mailbox.requeue(message) {
                None => return,
                Some(returned) => message = returned,
            }
        }
    }

    /// Detaches the mailbox for `key` and returns its undelivered messages.
    pub fn remove_key(&self, key: &str) -> Vec<Message> {
        match self.mailboxes.remove(key) {
            Some((_, mailbox)) => {
                debug!(queue = %self.name, key, "removing mailbox");
                mailbox.detach()
            }
            None => Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.mailboxes.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of queued messages across every key.
    pub fn len(&self) -> usize {
        self.mailboxes.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_waiters(&self) -> usize {
        let mailboxes: Vec<Arc<Mailbox>> =
            self.mailboxes.iter().map(|e| Arc::clone(e.value())).collect();
        mailboxes.iter().map(|m| m.close_waiters()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str) -> Queue {
        Queue::new(name, QueueLimits::default(), Arc::new(Lifecycle::new()))
    }

    #[test]
    fn keys_are_isolated() {
        let q = queue("world");
        q.push("x", "for-x").unwrap();
        assert!(q.pop("y", Duration::ZERO).is_none());
        assert_eq!(q.pop("x", Duration::ZERO).unwrap().payload().as_ref(), b"for-x");
    }

    #[test]
    fn pop_creates_mailbox_lazily() {
        let q = queue("world");
        assert!(q.keys().is_empty());
        assert!(q.pop("hello", Duration::ZERO).is_none());
        assert_eq!(q.keys(), vec!["hello".to_string()]);
    }

    #[test]
    fn remove_key_returns_leftovers() {
        let q = queue("world");
        q.push("k", "a").unwrap();
        q.push("k", "b").unwrap();
        let left = q.remove_key("k");
        assert_eq!(left.len(), 2);
        assert!(q.keys().is_empty());
        assert!(q.remove_key("k").is_empty());
    }

    #[test]
    fn requeue_preserves_head_position() {
        let q = queue("world");
        q.push("k", "2").unwrap();
        q.requeue(Message::new("k", "1"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop("k", Duration::ZERO).unwrap().payload().as_ref(), b"1");
    }

    #[test]
    fn undeliverable_messages_are_refused_at_push() {
        let limits = QueueLimits {
            max_depth: None,
            max_frame_len: 64,
        };
        let q = Queue::new("q", limits, Arc::new(Lifecycle::new()));

        // 9 header + 2 + 1 key + 8 timestamp + 4 length = 24 bytes of overhead.
        q.push("k", vec![0u8; 40]).unwrap();
        let err = q.push("k", vec![0u8; 41]).unwrap_err();
        assert_eq!(
            err,
            BrokerError::MessageTooLarge {
                key: "k".into(),
                size: 65,
                max: 64
            }
        );
        assert_eq!(q.len(), 1);

        let long_key = "k".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            q.push(&long_key, "x"),
            Err(BrokerError::KeyTooLong { .. })
        ));
    }
}
