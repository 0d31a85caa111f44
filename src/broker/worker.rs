//! One readiness loop: a mio `Poll` servicing the connections handed to
//! this worker by the acceptor.
//!
//! Cross-thread input arrives on a crossbeam channel: new sockets from the
//! acceptor, deferred pop completions from whichever thread pushed the
//! message, and the shutdown signal from the engine. Every sender wakes the
//! loop through the worker's `Waker`.
//!
//! A pop that has to wait never blocks this thread. It parks a completion on
//! the mailbox, arms a deadline, and the connection stops decoding frames
//! until the completion or the deadline resolves it.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, SendError, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::broker::connection::{Connection, PendingPop};
use crate::broker::timer::DeadlineQueue;
use crate::core::{BrokerError, Lifecycle, Message, PopOutcome, Queue, QueueRegistry};
use crate::metrics::Stats;
use crate::protocol::command::{ERR_MALFORMED, ERR_QUEUE_FULL, ERR_STOPPING, ERR_TOO_LARGE};
use crate::protocol::{FrameDecodeError, Reply, Request};

const WAKER: Token = Token(0);
const MAX_EVENTS: usize = 1024;

/// State every worker of one engine shares.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) registry: Arc<QueueRegistry>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) max_frame_len: u32,
}

pub(crate) enum WorkerEvent {
    Accept {
        stream: TcpStream,
        peer: SocketAddr,
        conn_id: u64,
    },
    PopCompleted {
        token: Token,
        seq: u64,
        queue: Arc<Queue>,
        outcome: Option<Message>,
    },
    Shutdown,
}

/// Sending side of a worker: its channel plus the waker that interrupts
/// its `poll`.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    index: usize,
    tx: Sender<WorkerEvent>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queues an event and wakes the loop. Gives the event back if the
    /// worker is gone.
    pub(crate) fn send(&self, event: WorkerEvent) -> Result<(), WorkerEvent> {
        self.tx.send(event).map_err(|SendError(event)| event)?;
        if let Err(err) = self.waker.wake() {
            warn!(worker = self.index, error = %err, "failed to wake worker");
        }
        Ok(())
    }

    fn complete_pop(&self, token: Token, seq: u64, queue: Arc<Queue>, outcome: Option<Message>) {
        let event = WorkerEvent::PopCompleted {
            token,
            seq,
            queue,
            outcome,
        };
        if let Err(WorkerEvent::PopCompleted {
            queue,
            outcome: Some(message),
            ..
        }) = self.send(event)
        {
            queue.requeue(message);
        }
    }
}

pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    rx: Receiver<WorkerEvent>,
    handle: WorkerHandle,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    next_seq: u64,
    deadlines: DeadlineQueue,
    shared: Arc<Shared>,
}

impl Worker {
    /// Builds a worker and returns it with its handle and a clone of its
    /// receiver, so the engine can sweep the channel after the thread exits.
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
    ) -> io::Result<(Self, WorkerHandle, Receiver<WorkerEvent>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = unbounded();
        let handle = WorkerHandle { index, tx, waker };

        let worker = Self {
            index,
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            rx: rx.clone(),
            handle: handle.clone(),
            connections: HashMap::new(),
            next_token: WAKER.0 + 1,
            next_seq: 0,
            deadlines: DeadlineQueue::new(),
            shared,
        };
        Ok((worker, handle, rx))
    }

    pub(crate) fn run(mut self) {
        info!(worker = self.index, "worker started");

        loop {
            let timeout = self.deadlines.next_timeout(Instant::now());
            if let Err(err) = self.poll.poll(&mut self.events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, error = %err, "poll failed; stopping worker");
                break;
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKER)
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                self.on_ready(token, readable, writable);
            }

            if !self.drain_channel() {
                break;
            }
            self.expire_deadlines(Instant::now());
        }

        self.shutdown();
        info!(worker = self.index, "worker stopped");
    }

    /// Returns `false` once the engine asked this worker to stop.
    fn drain_channel(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(WorkerEvent::Accept {
                    stream,
                    peer,
                    conn_id,
                }) => self.register(stream, peer, conn_id),
                Ok(WorkerEvent::PopCompleted {
                    token,
                    seq,
                    queue,
                    outcome,
                }) => self.on_pop_completed(token, seq, queue, outcome),
                Ok(WorkerEvent::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream, peer: SocketAddr, conn_id: u64) {
        // Tokens are never reused, so a late completion can't be mistaken
        // for one addressed to a newer connection.
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(err) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(worker = self.index, conn_id, error = %err, "failed to register connection");
            self.shared.stats.inc_connections_closed();
            return;
        }

        debug!(worker = self.index, conn_id, %peer, "connection registered");
        self.connections.insert(
            token,
            Connection::new(conn_id, peer, stream, self.shared.max_frame_len),
        );
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        if writable {
            if let Err(err) = conn.flush() {
                debug!(worker = self.index, conn_id = conn.id, error = %err, "write failed");
                self.close(token);
                return;
            }
        }

        if readable && !conn.peer_closed {
            if conn.pending.is_some() {
                conn.read_paused = true;
            } else if let Err(err) = conn.fill() {
                debug!(worker = self.index, conn_id = conn.id, error = %err, "read failed");
                self.close(token);
                return;
            }
        }

        self.service(token);
    }

    /// Decodes and executes buffered requests until the connection runs out
    /// of complete frames or parks on a pop.
    fn service(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.pending.is_some() {
                break;
            }

            let frame = match conn.buffer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) if conn.read_paused => {
                    // The parked pop resolved; pick up what arrived meanwhile.
                    conn.read_paused = false;
                    if let Err(err) = conn.fill() {
                        debug!(worker = self.index, conn_id = conn.id, error = %err, "read failed");
                        self.close(token);
                        return;
                    }
                    continue;
                }
                Ok(None) => break,
                Err(err) => {
                    self.reject(token, 0, err);
                    return;
                }
            };

            match Request::decode(&frame) {
                Ok(request) => self.execute(token, frame.request_id, request),
                Err(err) => {
                    self.reject(token, frame.request_id, err);
                    return;
                }
            }
        }

        self.finish(token);
    }

    fn execute(&mut self, token: Token, request_id: u64, request: Request) {
        match request {
            Request::Push {
                queue,
                key,
                payload,
            } => {
                let reply = match self.shared.registry.get_or_create(&queue).push(&key, payload) {
                    Ok(()) => {
                        self.shared.stats.inc_wire_pushed();
                        Reply::Ack
                    }
                    Err(err @ BrokerError::QueueFull { .. }) => {
                        Reply::error(ERR_QUEUE_FULL, err.to_string())
                    }
                    Err(
                        err @ (BrokerError::MessageTooLarge { .. }
                        | BrokerError::KeyTooLong { .. }),
                    ) => Reply::error(ERR_TOO_LARGE, err.to_string()),
                    Err(err) => Reply::error(ERR_STOPPING, err.to_string()),
                };
                trace!(worker = self.index, queue = %queue, key = %key, "push");
                self.reply(token, request_id, &reply);
            }
            Request::Pop {
                queue,
                key,
                timeout,
            } => self.start_pop(token, request_id, &queue, &key, timeout),
        }
    }

    fn start_pop(
        &mut self,
        token: Token,
        request_id: u64,
        queue_name: &str,
        key: &str,
        timeout: Duration,
    ) {
        let queue = self.shared.registry.get_or_create(queue_name);
        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = self.handle.clone();
        let owner = Arc::clone(&queue);
        let (mailbox, outcome) = queue.pop_or_wait(key, !timeout.is_zero(), move |outcome| {
            handle.complete_pop(token, seq, owner, outcome)
        });

        match outcome {
            PopOutcome::Ready(message) => self.deliver(token, request_id, &queue, message),
            PopOutcome::Empty => {
                if !timeout.is_zero() && !self.shared.lifecycle.accepts_waiters() {
                    debug!(worker = self.index, queue = queue_name, key, "pop refused while stopping");
                }
                self.reply(token, request_id, &Reply::Empty);
            }
            PopOutcome::Pending(ticket) => {
                // An unrepresentable deadline waits until a push or a stop.
                let deadline = Instant::now().checked_add(timeout);
                if let Some(at) = deadline {
                    self.deadlines.schedule(at, token, seq);
                }
                if let Some(conn) = self.connections.get_mut(&token) {
                    trace!(worker = self.index, conn_id = conn.id, queue = queue_name, key, "pop parked");
                    conn.pending = Some(PendingPop {
                        request_id,
                        seq,
                        deadline,
                        mailbox,
                        ticket,
                    });
                }
            }
        }
    }

    fn on_pop_completed(
        &mut self,
        token: Token,
        seq: u64,
        queue: Arc<Queue>,
        outcome: Option<Message>,
    ) {
        let pending = match self.connections.get_mut(&token) {
            Some(conn) if conn.pending_seq() == Some(seq) => conn.pending.take(),
            _ => None,
        };

        let Some(pending) = pending else {
            // Only a closed connection gets here; close() already dropped
            // the deadline.
            if let Some(message) = outcome {
                trace!(worker = self.index, queue = queue.name(), key = message.key(), "requeue undeliverable message");
                queue.requeue(message);
                self.shared.stats.inc_requeued();
            }
            return;
        };

        if let Some(at) = pending.deadline {
            self.deadlines.cancel(at, seq);
        }
        match outcome {
            Some(message) => self.deliver(token, pending.request_id, &queue, message),
            None => self.reply(token, pending.request_id, &Reply::Empty),
        }
        self.service(token);
    }

    /// Queues a MESSAGE reply. A message that cannot be sent goes back to
    /// the head of its mailbox and the client gets an error instead.
    fn deliver(&mut self, token: Token, request_id: u64, queue: &Queue, message: Message) {
        let Some(conn) = self.connections.get_mut(&token) else {
            queue.requeue(message);
            self.shared.stats.inc_requeued();
            return;
        };
        match conn.buffer.queue_message(request_id, message) {
            Ok(()) => self.shared.stats.inc_wire_popped(),
            Err((err, message)) => {
                error!(
                    worker = self.index,
                    conn_id = conn.id,
                    queue = queue.name(),
                    key = message.key(),
                    error = %err,
                    "undeliverable message requeued"
                );
                let fallback = Reply::error(ERR_TOO_LARGE, err.to_string());
                if let Err(err) = conn.buffer.queue_reply(request_id, &fallback) {
                    debug!(worker = self.index, conn_id = conn.id, error = %err, "error reply dropped");
                }
                queue.requeue(message);
                self.shared.stats.inc_requeued();
            }
        }
    }

    fn expire_deadlines(&mut self, now: Instant) {
        while let Some((token, seq)) = self.deadlines.pop_expired(now) {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };
            if conn.pending_seq() != Some(seq) {
                continue;
            }
            let cancelled = conn
                .pending
                .as_ref()
                .is_some_and(|p| p.mailbox.cancel(&p.ticket));
            if !cancelled {
                // A push claimed the ticket first; its completion is queued.
                continue;
            }
            let Some(pending) = conn.pending.take() else {
                continue;
            };

            self.shared.stats.inc_pop_timeouts();
            self.reply(token, pending.request_id, &Reply::Empty);
            self.service(token);
        }
    }

    fn reply(&mut self, token: Token, request_id: u64, reply: &Reply) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(err) = conn.buffer.queue_reply(request_id, reply) {
            error!(worker = self.index, conn_id = conn.id, error = %err, "failed to encode reply");
            let fallback = Reply::error(ERR_TOO_LARGE, err.to_string());
            if let Err(err) = conn.buffer.queue_reply(request_id, &fallback) {
                debug!(worker = self.index, conn_id = conn.id, error = %err, "error reply dropped");
            }
        }
    }

    /// Best-effort error reply for a malformed frame, then close.
    fn reject(&mut self, token: Token, request_id: u64, err: FrameDecodeError) {
        self.shared.stats.inc_protocol_errors();
        let code = match err {
            FrameDecodeError::FrameTooLarge(_) => ERR_TOO_LARGE,
            _ => ERR_MALFORMED,
        };
        if let Some(conn) = self.connections.get_mut(&token) {
            warn!(worker = self.index, conn_id = conn.id, peer = %conn.peer, error = %err, "protocol error");
            let _ = conn.buffer.queue_reply(request_id, &Reply::error(code, err.to_string()));
            let _ = conn.flush();
        }
        self.close(token);
    }

    /// Flushes replies and closes the connection once the peer is gone and
    /// nothing remains to be said.
    fn finish(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let drained = match conn.flush() {
            Ok(drained) => drained,
            Err(err) => {
                debug!(worker = self.index, conn_id = conn.id, error = %err, "write failed");
                self.close(token);
                return;
            }
        };
        if conn.peer_closed && (drained || conn.pending.is_some()) {
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if let Some(pending) = conn.pending.take() {
            // Losing the cancel means a delivery is already on the channel;
            // on_pop_completed will find no connection and requeue it.
            pending.mailbox.cancel(&pending.ticket);
            if let Some(at) = pending.deadline {
                self.deadlines.cancel(at, pending.seq);
            }
        }
        if let Err(err) = self.poll.registry().deregister(&mut conn.socket) {
            trace!(worker = self.index, conn_id = conn.id, error = %err, "deregister failed");
        }
        self.shared.stats.inc_connections_closed();
        debug!(
            worker = self.index,
            conn_id = conn.id,
            peer = %conn.peer,
            unread = conn.buffer.buffered_input(),
            "connection closed"
        );
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
        drain_orphans(&self.rx, &self.shared.stats);
    }
}

/// Empties a worker channel whose loop no longer runs. Delivered messages
/// go back to their mailboxes; sockets are dropped.
pub(crate) fn drain_orphans(rx: &Receiver<WorkerEvent>, stats: &Stats) {
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkerEvent::PopCompleted {
                queue,
                outcome: Some(message),
                ..
            } => {
                queue.requeue(message);
                stats.inc_requeued();
            }
            WorkerEvent::Accept { .. } => stats.inc_connections_closed(),
            WorkerEvent::PopCompleted { outcome: None, .. } | WorkerEvent::Shutdown => {}
        }
    }
}
