//! Accept path: owns the listening socket and hands each new connection to
//! a worker, round-robin. Connections never move between workers after that.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::broker::worker::{WorkerEvent, WorkerHandle};
use crate::metrics::Stats;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Lets the engine interrupt the accept loop from another thread.
pub(crate) struct AcceptorHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl AcceptorHandle {
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "failed to wake acceptor");
        }
    }
}

pub(crate) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    next_worker: usize,
    next_conn_id: u64,
    stop: Arc<AtomicBool>,
    stats: Arc<Stats>,
}

impl Acceptor {
    pub(crate) fn new(
        mut listener: TcpListener,
        workers: Vec<WorkerHandle>,
        stats: Arc<Stats>,
    ) -> io::Result<(Self, AcceptorHandle)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = Self {
            poll,
            listener,
            workers,
            next_worker: 0,
            next_conn_id: 1,
            stop: Arc::clone(&stop),
            stats,
        };
        Ok((acceptor, AcceptorHandle { stop, waker }))
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(128);
        info!(workers = self.workers.len(), "acceptor started");

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "acceptor poll failed");
                break;
            }

            let listener_ready = events.iter().any(|event| event.token() == LISTENER);
            if listener_ready && !self.stop.load(Ordering::SeqCst) {
                self.accept_pending();
            }
        }

        // Dropping the listener closes the socket.
        info!("acceptor stopped");
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, error = %err, "set_nodelay failed");
                    }
                    let conn_id = self.next_conn_id;
                    self.next_conn_id += 1;
                    self.stats.inc_connections_accepted();

                    let worker = &self.workers[self.next_worker % self.workers.len()];
                    self.next_worker = self.next_worker.wrapping_add(1);
                    debug!(conn_id, %peer, worker = worker.index(), "accepted connection");

                    let event = WorkerEvent::Accept {
                        stream,
                        peer,
                        conn_id,
                    };
                    if worker.send(event).is_err() {
                        warn!(conn_id, "worker gone; dropping connection");
                        self.stats.inc_connections_closed();
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Typically EMFILE; the next readiness event retries.
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }
}
