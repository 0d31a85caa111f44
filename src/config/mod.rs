use serde::Deserialize;
use std::{env, fs, path::Path};
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:33444";
/// Worker threads per detected core when `server.workers` is unset.
pub const WORKERS_PER_CORE: usize = 4;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// `None` → `num_cpus × WORKERS_PER_CORE`.
    pub workers: Option<usize>,
    pub max_frame_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            workers: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-mailbox message bound; `None` keeps mailboxes unbounded.
    pub max_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queues: QueueConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

impl Config {
    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: built-in defaults, then the file (`path`, or
    /// `TURBOMQ_CONFIG`), then `TURBOMQ_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = path
            .map(|s| s.to_string())
            .or_else(|| env::var("TURBOMQ_CONFIG").ok());

        let mut config = match effective_path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TURBOMQ_BIND_ADDR") {
            self.server.bind_addr = v;
        }

        if let Some(v) = lookup("TURBOMQ_WORKERS") {
            let n: usize = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("TURBOMQ_WORKERS: {e}")))?;
            self.server.workers = Some(n);
        }

        if let Some(v) = lookup("TURBOMQ_MAX_FRAME_LEN") {
            self.server.max_frame_len = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("TURBOMQ_MAX_FRAME_LEN: {e}")))?;
        }

        if let Some(v) = lookup("TURBOMQ_MAX_QUEUE_DEPTH") {
            let depth: usize = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("TURBOMQ_MAX_QUEUE_DEPTH: {e}")))?;
            self.queues.max_depth = (depth > 0).then_some(depth);
        }

        Ok(())
    }

    /// Number of worker threads the engine will start.
    pub fn worker_count(&self) -> usize {
        match self.server.workers {
            Some(n) if n > 0 => n,
            _ => num_cpus::get().max(1) * WORKERS_PER_CORE,
        }
    }
}
