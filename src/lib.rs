//! # Microblog Core
//!
//! Search-index synchronization, background task tracking, and notification
//! delivery for a microblogging service.
//!
//! Posts live in a relational store (SQLite); a full-text search service
//! mirrors their searchable fields. Every write runs in a
//! [`UnitOfWork`](uow::UnitOfWork) that records the rows it touched; once the
//! transaction commits, the recorded changes are replayed into the index.
//! Long-running work (post exports) is queued for a separate worker process,
//! tracked in a task ledger, and reported through per-user notifications.
//!
//! ## Architecture
//!
//! ```text
//!   mb (HTTP / CLI)                                 mb-worker
//! ┌──────────────────┐  enqueue   ┌───────────┐  claim  ┌────────────┐
//! │ posts / messages │──────────▶│ job queue │◀────────│ JobHandler │
//! │ tasks::launch    │            └───────────┘  meta   └─────┬──────┘
//! └────────┬─────────┘                                         │
//!          │ UnitOfWork                                        │ ledger +
//!          ▼                                                   ▼ outbox
//!   ┌─────────────┐  commit ok   ┌─────────────┐        ┌─────────────┐
//!   │  IndexSync  │─────────────▶│ SearchIndex │        │   SQLite    │
//!   └─────────────┘  replay      └─────────────┘        │ relational  │
//!                                                       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mb init                       # create schema, queue store, index
//! mb serve                      # start the HTTP API
//! mb-worker                     # run background jobs
//! mb reindex --table posts      # rebuild the search index
//! mb search "rust" --page 2
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Connection pools and the [`Database`](db::Database) handle |
//! | [`migrate`] | Relational schema |
//! | [`models`] | Row types and the [`Entity`](models::Entity) trait |
//! | [`search`] | Search index adapter and backends |
//! | [`registry`] | Searchable-field registry |
//! | [`uow`] | Unit of work and change sets |
//! | [`sync`] | Commit-to-index replay and full reindex |
//! | [`posts`] | User and post writes, hydrated search |
//! | [`messages`] | Private messages |
//! | [`outbox`] | Notification outbox |
//! | [`queue`] | Job queue |
//! | [`tasks`] | Task ledger |
//! | [`worker`] | Background worker |
//! | [`export`] | Post export job |
//! | [`server`] | JSON HTTP API |

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod logging;
pub mod messages;
pub mod migrate;
pub mod models;
pub mod outbox;
pub mod posts;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod search;
pub mod server;
pub mod stats;
pub mod sync;
pub mod tasks;
pub mod uow;
pub mod worker;
