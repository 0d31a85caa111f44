//! TurboMQ – an in-memory, key-addressed message broker.
//!
//! This crate exports
//!  * `core`     – messages, per-key mailboxes, queues and the registry
//!  * `protocol` – length-prefixed framing and the PUSH/POP codec
//!  * `broker`   – the engine: acceptor, readiness-loop workers, lifecycle
//!  * `client`   – local and remote `{push, pop}` queue handles
//!  * `config`   – TOML-driven runtime configuration
//!
//! Applications can embed an [`Engine`] and use [`LocalQueue`] handles, or
//! talk to a running `turbomq` daemon through [`Client`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod protocol;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::Engine;
pub use client::{Client, ClientError, LocalQueue, MessageQueue, RemoteQueue};
pub use config::{load_config, Config};
pub use crate::core::{BrokerError, EngineState, Message};
