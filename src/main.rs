//! # Microblog CLI (`mb`)
//!
//! The web-facing process: schema setup, the JSON HTTP API, and index
//! maintenance. Background jobs run in the separate `mb-worker` binary.
//!
//! ## Usage
//!
//! ```bash
//! mb --config ./config/mb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mb init` | Create the relational schema, queue store, and search index |
//! | `mb serve` | Start the HTTP API |
//! | `mb reindex` | Re-add every row of a searchable table to the index |
//! | `mb search "<text>"` | Search posts |
//! | `mb stats` | Store and queue overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use microblog_core::config;
use microblog_core::db::Database;
use microblog_core::logging::init_tracing;
use microblog_core::migrate;
use microblog_core::models::{Entity, Post};
use microblog_core::posts;
use microblog_core::progress::ProgressMode;
use microblog_core::queue::SqliteJobQueue;
use microblog_core::search::SearchIndex;
use microblog_core::server;
use microblog_core::stats;

/// Microblog: posts, search-index sync, and background tasks.
#[derive(Parser)]
#[command(name = "mb", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the relational schema, the job queue store, and the search
    /// index. Idempotent.
    Init,

    /// Start the JSON HTTP API on `[server].bind`.
    Serve,

    /// Rebuild the search documents of a table from the relational store.
    ///
    /// Safe to run while the server is handling traffic.
    Reindex {
        /// Table to reindex.
        #[arg(long, default_value = "posts")]
        table: String,

        /// Progress output on stderr: off, human, or json. Defaults to human
        /// when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Search posts.
    Search {
        /// Free-text query.
        text: String,

        /// Result page, starting at 1.
        #[arg(long, default_value_t = 1)]
        page: i64,
    },

    /// Show row counts, open tasks, and queue status.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let queue = SqliteJobQueue::open(&cfg.queue).await?;
            queue.close().await;
            let index = SearchIndex::connect(&cfg.search).await?;
            println!("Database initialized successfully.");
            println!("  relational store: {}", cfg.db.path.display());
            println!("  job queue:        {}", cfg.queue.path.display());
            println!("  search backend:   {}", index.backend_name());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Reindex { table, progress } => {
            let mode = match progress.as_deref() {
                Some(value) => ProgressMode::parse(value)?,
                None => ProgressMode::default_for_tty(),
            };
            let db = Database::open(&cfg).await?;
            if !db.index().is_enabled() {
                anyhow::bail!("Search is disabled; set [search].backend to reindex");
            }
            let reporter = mode.reporter();
            let indexed = db
                .sync()
                .reindex_table(db.pool(), &table, reporter.as_ref())
                .await?;
            println!("Reindexed {} {} rows.", indexed, table);
            db.close().await;
        }
        Commands::Search { text, page } => {
            let db = Database::open(&cfg).await?;
            let result = posts::search(&db, &text, page, cfg.search.per_page).await?;
            if result.posts.is_empty() {
                println!("No results.");
            }
            for post in &result.posts {
                println!("[{}] user {}: {}", post.id, post.user_id, post.body);
            }
            println!();
            println!(
                "{} {} total, page {}{}",
                result.total,
                Post::TABLE,
                result.page,
                result
                    .next_page
                    .map(|n| format!(" (next: --page {})", n))
                    .unwrap_or_default()
            );
            db.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
