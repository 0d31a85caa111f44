//! Engine lifecycle: Idle → Running → Stopped → Destroyed.
//!
//! `run` binds the listener and starts one acceptor thread plus a fixed pool
//! of worker threads. `stop` tears the threads down but keeps every queue;
//! `destroy` drops the queues and retires the engine for good.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;
use mio::net::TcpListener;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::broker::acceptor::{Acceptor, AcceptorHandle};
use crate::broker::worker::{drain_orphans, Shared, Worker, WorkerEvent, WorkerHandle};
use crate::client::LocalQueue;
use crate::config::Config;
use crate::core::{BrokerError, EngineState, Lifecycle, QueueLimits, QueueRegistry};
use crate::metrics::Stats;

/// Threads and channels that exist only while the engine is running.
struct Runtime {
    local_addr: SocketAddr,
    acceptor: AcceptorHandle,
    acceptor_thread: JoinHandle<()>,
    workers: Vec<WorkerHandle>,
    worker_threads: Vec<JoinHandle<()>>,
    receivers: Vec<Receiver<WorkerEvent>>,
}

pub struct Engine {
    config: Config,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<QueueRegistry>,
    stats: Arc<Stats>,
    runtime: Mutex<Option<Runtime>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        let limits = QueueLimits {
            max_depth: config.queues.max_depth,
            max_frame_len: config.server.max_frame_len,
        };
        let registry = Arc::new(QueueRegistry::new(limits, Arc::clone(&lifecycle)));
        Self {
            config,
            lifecycle,
            registry,
            stats: Arc::new(Stats::default()),
            runtime: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|rt| rt.local_addr)
    }

    /// Names of every queue referenced so far.
    pub fn queue_names(&self) -> Result<Vec<String>, BrokerError> {
        self.lifecycle.ensure_usable("queue_names")?;
        Ok(self.registry.names())
    }

    /// In-process handle to the queue `name`, created on first use.
    pub fn get_queue(&self, name: &str) -> Result<LocalQueue, BrokerError> {
        self.lifecycle.ensure_usable("get_queue")?;
        Ok(LocalQueue::new(
            self.registry.get_or_create(name),
            Arc::clone(&self.lifecycle),
        ))
    }

    /// Binds `server.bind_addr` and starts serving. Only valid from Idle.
    pub fn run(&self) -> Result<SocketAddr, BrokerError> {
        let mut slot = self.runtime.lock();
        let state = self.lifecycle.state();
        if state != EngineState::Idle {
            return Err(BrokerError::InvalidState {
                operation: "run",
                state,
            });
        }

        let std_listener = std::net::TcpListener::bind(&self.config.server.bind_addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = TcpListener::from_std(std_listener);

        let shared = Arc::new(Shared {
            registry: Arc::clone(&self.registry),
            lifecycle: Arc::clone(&self.lifecycle),
            stats: Arc::clone(&self.stats),
            max_frame_len: self.config.server.max_frame_len,
        });

        let worker_count = self.config.worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let spawned = Worker::new(index, Arc::clone(&shared)).and_then(|(worker, handle, rx)| {
                thread::Builder::new()
                    .name(format!("turbomq-worker-{index}"))
                    .spawn(move || worker.run())
                    .map(|join| (join, handle, rx))
            });
            match spawned {
                Ok((join, handle, rx)) => {
                    worker_threads.push(join);
                    workers.push(handle);
                    receivers.push(rx);
                }
                Err(err) => {
                    error!(worker = index, error = %err, "failed to start worker");
                    shutdown_workers(&workers, worker_threads);
                    return Err(err.into());
                }
            }
        }

        let spawned = Acceptor::new(listener, workers.clone(), Arc::clone(&self.stats))
            .and_then(|(acceptor, handle)| {
                thread::Builder::new()
                    .name("turbomq-acceptor".to_string())
                    .spawn(move || acceptor.run())
                    .map(|join| (join, handle))
            });
        let (acceptor_thread, acceptor) = match spawned {
            Ok(started) => started,
            Err(err) => {
                error!(error = %err, "failed to start acceptor");
                shutdown_workers(&workers, worker_threads);
                return Err(err.into());
            }
        };

        self.lifecycle
            .transition("run", &[EngineState::Idle], EngineState::Running)?;
        *slot = Some(Runtime {
            local_addr,
            acceptor,
            acceptor_thread,
            workers,
            worker_threads,
            receivers,
        });

        info!(addr = %local_addr, workers = worker_count, "engine running");
        Ok(local_addr)
    }

    /// Closes the listener and every connection and releases blocked pops
    /// with "no message". Queue contents survive. Only valid from Running.
    pub fn stop(&self) -> Result<(), BrokerError> {
        let mut slot = self.runtime.lock();
        self.lifecycle
            .transition("stop", &[EngineState::Running], EngineState::Stopped)?;
        let Some(runtime) = slot.take() else {
            return Ok(());
        };

        runtime.acceptor.shutdown();
        if runtime.acceptor_thread.join().is_err() {
            error!("acceptor thread panicked");
        }

        // Remote waiters get their EMPTY replies queued before the workers
        // see the shutdown event behind them.
        let released = self.registry.close_waiters();

        shutdown_workers(&runtime.workers, runtime.worker_threads);
        for rx in &runtime.receivers {
            drain_orphans(rx, &self.stats);
        }

        info!(released, "engine stopped");
        Ok(())
    }

    /// Frees every queue and message. Valid from Idle or Stopped; every
    /// later operation fails.
    pub fn destroy(&self) -> Result<(), BrokerError> {
        let _slot = self.runtime.lock();
        self.lifecycle.transition(
            "destroy",
            &[EngineState::Idle, EngineState::Stopped],
            EngineState::Destroyed,
        )?;
        // Waiters hold completions that may reference their queue; release
        // them before the queues go.
        self.registry.close_waiters();
        self.registry.clear();
        info!("engine destroyed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.lifecycle.state() == EngineState::Running {
            if let Err(err) = self.stop() {
                warn!(error = %err, "failed to stop engine on drop");
            }
        }
    }
}

fn shutdown_workers(workers: &[WorkerHandle], threads: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.send(WorkerEvent::Shutdown).is_err() {
            warn!(worker = worker.index(), "worker already gone");
        }
    }
    for (index, join) in threads.into_iter().enumerate() {
        if join.join().is_err() {
            error!(worker = index, "worker thread panicked");
        }
    }
}
