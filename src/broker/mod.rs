//! # Broker Module
//!
//! The network side of the broker.
//!
//! - `engine`: lifecycle (run / stop / destroy) and thread ownership.
//! - `acceptor`: the listening socket; spreads connections over workers.
//! - `worker`: one mio readiness loop per thread, serving PUSH and POP.
//! - `connection`: per-socket framing buffers and the parked-pop slot.
//! - `timer`: pop deadlines for a worker.

mod acceptor;
mod connection;
pub mod engine;
mod timer;
mod worker;

pub use self::engine::Engine;
