//! `{push, pop}` handles onto a queue.
//!
//! [`LocalQueue`] talks to an in-process [`Engine`](crate::Engine) directly;
//! [`RemoteQueue`] speaks the wire protocol to a running engine over TCP.
//! Both implement [`MessageQueue`], so callers can be written once.

use std::time::Duration;

use bytes::Bytes;

use crate::core::Message;

mod local;
mod remote;

pub use local::LocalQueue;
pub use remote::{Client, ClientError, RemoteQueue};

pub trait MessageQueue {
    type Error;

    /// Appends `payload` to the mailbox for `key`.
    fn push(&self, key: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Takes the oldest message for `key`, waiting up to `timeout` for one
    /// to arrive. `Duration::ZERO` polls without waiting. `Ok(None)` means
    /// nothing arrived in time, or the engine stopped.
    fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Message>, Self::Error>;

    /// [`MessageQueue::pop`] with the timeout in fractional seconds.
    /// Negative or non-finite values poll.
    fn pop_secs(&self, key: &str, seconds: f64) -> Result<Option<Message>, Self::Error> {
        let timeout = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
        self.pop(key, timeout)
    }
}
