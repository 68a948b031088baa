//! End-to-end runs of the `mb` and `mb-worker` binaries. The test process
//! plays the web tier through the library; the binaries only share the
//! on-disk stores with it.

use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use microblog_core::config::load_config;
use microblog_core::db::Database;
use microblog_core::export::{export_path, EXPORT_POSTS};
use microblog_core::posts;
use microblog_core::queue::SqliteJobQueue;
use microblog_core::tasks;

fn setup_test_env(backend: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/mb.sqlite"

[search]
backend = "{backend}"
path = "{root}/data/search.sqlite"

[queue]
path = "{root}/data/queue.sqlite"

[worker]
export_dir = "{root}/exports"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display(),
        backend = backend
    );

    let config_path = config_dir.join("mb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run(binary: &str, config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run {}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_mb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run(env!("CARGO_BIN_EXE_mb"), config_path, args)
}

fn run_worker(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run(env!("CARGO_BIN_EXE_mb-worker"), config_path, args)
}

#[tokio::test]
async fn init_search_worker_and_stats() {
    let (_tmp, config_path) = setup_test_env("sqlite");

    let (stdout, stderr, ok) = run_mb(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(stdout.contains("sqlite"));

    // Second init is a no-op
    let (_, _, ok) = run_mb(&config_path, &["init"]);
    assert!(ok);

    let config = load_config(&config_path).unwrap();
    let task_id = {
        let db = Database::open(&config).await.unwrap();
        let queue = SqliteJobQueue::open(&config.queue).await.unwrap();
        let ann = posts::create_user(&db, "ann", "ann@example.com").await.unwrap();
        posts::create(&db, ann.id, "shipping the rust rewrite", None)
            .await
            .unwrap();
        posts::create(&db, ann.id, "weekend hike photos", None)
            .await
            .unwrap();

        let mut uow = db.begin().await.unwrap();
        let task = tasks::launch(
            uow.conn(),
            &queue,
            ann.id,
            EXPORT_POSTS,
            "Exporting posts...",
            json!([]),
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        queue.close().await;
        db.close().await;
        task.id
    };

    let (stdout, stderr, ok) = run_mb(&config_path, &["search", "rust"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("shipping the rust rewrite"));
    assert!(!stdout.contains("weekend hike"));

    let (stdout, stderr, ok) = run_worker(&config_path, &["--once"]);
    assert!(ok, "worker failed: {}", stderr);
    assert!(stdout.contains("Ran 1 job(s)."));
    assert!(export_path(&config.worker.export_dir, 1, &task_id).exists());

    let db = Database::open(&config).await.unwrap();
    let task = tasks::get(db.pool(), &task_id).await.unwrap().unwrap();
    assert!(task.complete);
    db.close().await;

    let (stdout, _, ok) = run_mb(&config_path, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("Posts:         2"));
    assert!(stdout.contains("0 in progress"));
}

#[tokio::test]
async fn reindex_reports_progress() {
    let (_tmp, config_path) = setup_test_env("sqlite");
    let (_, stderr, ok) = run_mb(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);

    let config = load_config(&config_path).unwrap();
    {
        let db = Database::open(&config).await.unwrap();
        let ann = posts::create_user(&db, "ann", "ann@example.com").await.unwrap();
        for i in 0..3 {
            posts::create(&db, ann.id, &format!("post number {}", i), None)
                .await
                .unwrap();
        }
        db.close().await;
    }

    let (stdout, stderr, ok) = run_mb(
        &config_path,
        &["reindex", "--table", "posts", "--progress", "json"],
    );
    assert!(ok, "reindex failed: {}", stderr);
    assert!(stdout.contains("Reindexed 3 posts rows."));
    assert!(stderr.contains("\"event\":\"done\""));

    let (stdout, _, ok) = run_mb(&config_path, &["search", "number"]);
    assert!(ok);
    assert!(stdout.contains("3 posts total"));
}

#[test]
fn reindex_requires_enabled_search() {
    let (_tmp, config_path) = setup_test_env("disabled");
    let (_, _, ok) = run_mb(&config_path, &["init"]);
    assert!(ok);

    let (_, stderr, ok) = run_mb(&config_path, &["reindex"]);
    assert!(!ok);
    assert!(stderr.contains("Search is disabled"));
}

#[test]
fn bad_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("solr");
    let (_, stderr, ok) = run_mb(&config_path, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("solr"));
}
