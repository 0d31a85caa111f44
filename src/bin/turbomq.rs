//! turbomq – one binary that starts the broker or runs one-shot client
//! commands against a running one.
//
//  $ turbomq start --config turbomq.toml
//  $ turbomq push 127.0.0.1:33444 world hello turbo
//  $ turbomq pop 127.0.0.1:33444 world hello --timeout 1.5
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use turbomq::logging::init_logging;
use turbomq::{Client, Config, Engine};

#[derive(Debug, Parser)]
#[command(name = "turbomq", version, about = "TurboMQ broker & CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon; Ctrl-C stops it.
    Start {
        /// Path to config TOML (env TURBOMQ_CONFIG is used when absent)
        #[arg(short, long)]
        config: Option<String>,
        /// Listen address, overriding the config file
        #[arg(short, long)]
        bind: Option<String>,
        /// Worker thread count, overriding the config file
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Push one message and wait for the acknowledgement.
    Push {
        /// Config TOML whose `server.max_frame_len` the client honours
        #[arg(short, long)]
        config: Option<String>,
        addr: String,
        queue: String,
        key: String,
        payload: String,
    },
    /// Pop one message, waiting up to --timeout seconds.
    Pop {
        /// Config TOML whose `server.max_frame_len` the client honours
        #[arg(short, long)]
        config: Option<String>,
        addr: String,
        queue: String,
        key: String,
        #[arg(short, long, default_value_t = 0.0)]
        timeout: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start {
            config,
            bind,
            workers,
        } => {
            let mut cfg = Config::load(config.as_deref()).context("loading configuration")?;
            if let Some(bind) = bind {
                cfg.server.bind_addr = bind;
            }
            if workers.is_some() {
                cfg.server.workers = workers;
            }
            serve(cfg).await?;
        }
        Command::Push {
            config,
            addr,
            queue,
            key,
            payload,
        } => {
            let cfg = Config::load(config.as_deref()).context("loading configuration")?;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let client = Client::connect_with(addr.as_str(), cfg.server.max_frame_len)
                    .with_context(|| format!("connecting to {addr}"))?;
                client.push(&queue, &key, payload.into_bytes().into())?;
                println!("OK");
                Ok(())
            })
            .await??;
        }
        Command::Pop {
            config,
            addr,
            queue,
            key,
            timeout,
        } => {
            let cfg = Config::load(config.as_deref()).context("loading configuration")?;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let client = Client::connect_with(addr.as_str(), cfg.server.max_frame_len)
                    .with_context(|| format!("connecting to {addr}"))?;
                let timeout = Duration::try_from_secs_f64(timeout).unwrap_or(Duration::ZERO);
                match client.pop(&queue, &key, timeout)? {
                    Some(message) => println!("{}", String::from_utf8_lossy(message.payload())),
                    None => println!("(empty)"),
                }
                Ok(())
            })
            .await??;
        }
    }
    Ok(())
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let engine = Engine::new(cfg);
    let addr = engine.run().context("starting engine")?;
    println!("📡 TurboMQ broker listening on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("received Ctrl-C, shutting down");

    engine.stop()?;
    info!("final counters:\n{}", engine.stats().render());
    engine.destroy()?;
    Ok(())
}
