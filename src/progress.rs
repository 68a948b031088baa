//! Reindex progress reporting.
//!
//! Reports observable progress during `mb reindex` so operators see which
//! table is being rebuilt and how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a reindex run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReindexEvent {
    /// Counting rows of `table` before indexing starts.
    Counting { table: String },
    /// `n` rows of `total` have been sent to the index.
    Indexing { table: String, n: u64, total: u64 },
    /// Reindex of `table` finished.
    Done { table: String, indexed: u64 },
}

/// Receives reindex progress. Implementations write to stderr (human or JSON).
pub trait ReindexReporter: Send + Sync {
    fn report(&self, event: ReindexEvent);
}

/// Human-friendly progress on stderr: "reindex posts  1,234 / 5,000 rows".
pub struct StderrProgress;

impl ReindexReporter for StderrProgress {
    fn report(&self, event: ReindexEvent) {
        let line = match &event {
            ReindexEvent::Counting { table } => format!("reindex {}  counting...\n", table),
            ReindexEvent::Indexing { table, n, total } => format!(
                "reindex {}  {} / {} rows\n",
                table,
                format_number(*n),
                format_number(*total)
            ),
            ReindexEvent::Done { table, indexed } => {
                format!("reindex {}  done, {} rows\n", table, format_number(*indexed))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ReindexReporter for JsonProgress {
    fn report(&self, event: ReindexEvent) {
        let obj = match &event {
            ReindexEvent::Counting { table } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "counting"
            }),
            ReindexEvent::Indexing { table, n, total } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "indexing",
                "n": n,
                "total": total
            }),
            ReindexEvent::Done { table, indexed } => serde_json::json!({
                "event": "done",
                "table": table,
                "indexed": indexed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ReindexReporter for NoProgress {
    fn report(&self, _event: ReindexEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("Unknown progress mode: '{}'. Use off, human, or json.", other),
        }
    }

    pub fn reporter(&self) -> Box<dyn ReindexReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
