use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// A payload deposited under a topic key.
///
/// Immutable once built. The mailbox owns it until a pop hands it to the
/// caller (or to the reply path of a connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: String,
    payload: Bytes,
    enqueued_at: u64,
}

impl Message {
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_timestamp(key, payload, current_timestamp())
    }

    pub fn with_timestamp(key: impl Into<String>, payload: impl Into<Bytes>, enqueued_at: u64) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            enqueued_at,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Milliseconds since the Unix epoch at which the message was built.
    #[inline]
    pub fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keeps_exact_bytes() {
        let raw = vec![0u8, 255, 10, 13, 0];
        let msg = Message::new("hello", raw.clone());
        assert_eq!(msg.key(), "hello");
        assert_eq!(msg.payload().as_ref(), raw.as_slice());
        assert!(msg.enqueued_at() > 0);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let msg = Message::new("k", Bytes::new());
        assert!(msg.payload().is_empty());
    }
}
