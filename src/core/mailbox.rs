//! Per-key FIFO of messages with blocking-pop-with-timeout semantics.
//!
//! A consumer that finds the mailbox empty leaves a [`Ticket`] and a
//! completion callback behind. A later push hands its message straight to
//! the oldest ticket it can fulfil, under the mailbox lock, so there is no
//! window where a message sits in the FIFO while a consumer is waiting.
//!
//! The completion runs on the pushing thread, after the lock is released.
//! Worker threads use it to post a deferred reply to their own event loop;
//! local callers use it to feed a one-slot channel they block on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::trace;

use crate::core::error::BrokerError;
use crate::core::lifecycle::Lifecycle;
use crate::core::message::Message;

const WAITING: u8 = 0;
const FULFILLED: u8 = 1;
const CANCELLED: u8 = 2;

/// Claim on the next message of a mailbox.
///
/// Exactly one of "a push fulfils it" and "its owner cancels it" wins.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    state: AtomicU8,
}

impl Ticket {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(WAITING),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    fn try_fulfill(&self) -> bool {
        self.state
            .compare_exchange(WAITING, FULFILLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Called exactly once with the message, or with `None` when the waiter is
/// released without one (engine stop, key removed).
pub type Completion = Box<dyn FnOnce(Option<Message>) + Send>;

struct Waiter {
    ticket: Arc<Ticket>,
    complete: Completion,
}

/// Result of offering a pop to a mailbox.
pub enum PopOutcome {
    /// A message was already queued.
    Ready(Message),
    /// Nothing queued and the caller may not wait.
    Empty,
    /// The caller is now registered; its completion will fire later.
    Pending(Arc<Ticket>),
}

impl fmt::Debug for PopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopOutcome::Ready(m) => f.debug_tuple("Ready").field(m).finish(),
            PopOutcome::Empty => f.write_str("Empty"),
            PopOutcome::Pending(t) => f.debug_tuple("Pending").field(&t.id()).finish(),
        }
    }
}

#[derive(Default)]
struct MailboxInner {
    messages: VecDeque<Message>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    detached: bool,
}

pub struct Mailbox {
    key: String,
    capacity: Option<usize>,
    lifecycle: Arc<Lifecycle>,
    inner: Mutex<MailboxInner>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("key", &self.key)
            .field("messages", &inner.messages.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Mailbox {
    pub fn new(key: impl Into<String>, capacity: Option<usize>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            key: key.into(),
            capacity,
            lifecycle,
            inner: Mutex::new(MailboxInner::default()),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers currently parked on this mailbox.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Appends a message, or hands it directly to the oldest waiter.
    pub fn push(&self, message: Message) -> Result<(), BrokerError> {
        match self.deposit(message)? {
            None => Ok(()),
            Some(_) => Err(BrokerError::KeyRemoved {
                key: self.key.clone(),
            }),
        }
    }

    /// Like [`Mailbox::push`], but gives the message back if the mailbox
    /// has been detached so the caller can retry on the live one.
    pub(crate) fn deposit(&self, message: Message) -> Result<Option<Message>, BrokerError> {
        let mut inner = self.inner.lock();
        if inner.detached {
            return Ok(Some(message));
        }
        if let Some(waiter) = Self::next_waiter(&mut inner) {
            drop(inner);
            (waiter.complete)(Some(message));
            return Ok(None);
        }

        if let Some(capacity) = self.capacity {
            if inner.messages.len() >= capacity {
                return Err(BrokerError::QueueFull {
                    key: self.key.clone(),
                    capacity,
                });
            }
        }
        inner.messages.push_back(message);
        Ok(None)
    }

    /// Puts back a message that was dequeued but never reached its consumer.
    ///
    /// It goes to the head of the FIFO (or to the next waiter) and ignores
    /// the capacity bound. Returns the message if this mailbox has been
    /// detached from its queue.
    pub fn requeue(&self, message: Message) -> Option<Message> {
        let mut inner = self.inner.lock();
        if inner.detached {
            return Some(message);
        }
        if let Some(waiter) = Self::next_waiter(&mut inner) {
            drop(inner);
            (waiter.complete)(Some(message));
            return None;
        }
        inner.messages.push_front(message);
        None
    }

    pub fn try_pop(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Dequeues the oldest message, or registers `complete` to receive the
    /// next one when `wait` is set and the engine still accepts waiters.
    pub fn pop_or_wait<F>(&self, wait: bool, complete: F) -> PopOutcome
    where
        F: FnOnce(Option<Message>) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.messages.pop_front() {
            return PopOutcome::Ready(message);
        }
        if !wait || inner.detached || !self.lifecycle.accepts_waiters() {
            return PopOutcome::Empty;
        }

        inner.next_ticket += 1;
        let ticket = Arc::new(Ticket::new(inner.next_ticket));
        inner.waiters.push_back(Waiter {
            ticket: Arc::clone(&ticket),
            complete: Box::new(complete),
        });
        trace!(key = %self.key, ticket = ticket.id(), "consumer parked");
        PopOutcome::Pending(ticket)
    }

    /// Withdraws a parked consumer. Returns `false` if a push (or a release)
    /// already claimed the ticket; its completion is then on its way.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        let mut inner = self.inner.lock();
        if !ticket.try_cancel() {
            return false;
        }
        inner.waiters.retain(|w| w.ticket.id() != ticket.id());
        true
    }

    /// Blocking pop used by in-process consumers.
    ///
    /// A zero timeout is a non-blocking poll. The deadline starts once the
    /// mailbox has accepted the request.
    pub fn pop(&self, timeout: Duration) -> Option<Message> {
        if timeout.is_zero() {
            return self.try_pop();
        }

        let (tx, rx) = bounded(1);
        let ticket = match self.pop_or_wait(true, move |m| {
            let _ = tx.send(m);
        }) {
            PopOutcome::Ready(message) => return Some(message),
            PopOutcome::Empty => return None,
            PopOutcome::Pending(ticket) => ticket,
        };
        let received = match Instant::now().checked_add(timeout) {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.cancel(&ticket) {
                    None
                } else {
                    rx.recv().ok().flatten()
                }
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Releases every parked consumer with "no message".
    pub fn close_waiters(&self) -> usize {
        let released = {
            let mut inner = self.inner.lock();
            Self::drain_waiters(&mut inner)
        };
        let count = released.len();
        for waiter in released {
            (waiter.complete)(None);
        }
        count
    }

    /// Marks the mailbox as removed from its queue and returns whatever it
    /// still held. Parked consumers are released with "no message".
    pub fn detach(&self) -> Vec<Message> {
        let (messages, released) = {
            let mut inner = self.inner.lock();
            inner.detached = true;
            let messages: Vec<Message> = inner.messages.drain(..).collect();
            (messages, Self::drain_waiters(&mut inner))
        };
        for waiter in released {
            (waiter.complete)(None);
        }
        messages
    }

    fn next_waiter(inner: &mut MailboxInner) -> Option<Waiter> {
        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.ticket.try_fulfill() {
                return Some(waiter);
            }
        }
        None
    }

    fn drain_waiters(inner: &mut MailboxInner) -> Vec<Waiter> {
        inner
            .waiters
            .drain(..)
            .filter(|w| w.ticket.try_fulfill())
            .collect()
    }
}
