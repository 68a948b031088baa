//! # Background worker (`mb-worker`)
//!
//! Claims jobs from the queue store and runs them. Shares nothing with the
//! `mb` process except the relational store and the queue store.
//!
//! ```bash
//! mb-worker --config ./config/mb.toml          # run until ctrl-c
//! mb-worker --config ./config/mb.toml --once   # drain the queue and exit
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use microblog_core::config;
use microblog_core::db;
use microblog_core::logging::init_tracing;
use microblog_core::queue::SqliteJobQueue;
use microblog_core::worker::{JobRegistry, Worker};

/// Runs microblog background jobs.
#[derive(Parser)]
#[command(name = "mb-worker", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, default_value = "./config/mb.toml")]
    config: PathBuf,

    /// Run every queued job, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let pool = db::connect(&cfg).await?;
    let queue = SqliteJobQueue::open(&cfg.queue).await?;
    let worker = Worker::new(
        pool.clone(),
        Arc::new(queue),
        JobRegistry::with_builtins(&cfg),
        Duration::from_millis(cfg.queue.poll_interval_ms),
    )
    .with_abandon_after(Duration::from_secs(cfg.queue.abandon_after_secs));

    if cli.once {
        let count = worker.drain().await?;
        println!("Ran {} job(s).", count);
    } else {
        worker.run().await?;
    }

    pool.close().await;
    Ok(())
}
