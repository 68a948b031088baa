//! Commit-to-index synchronization against a real SQLite store.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use microblog_core::db::{self, Database};
use microblog_core::error::SearchError;
use microblog_core::migrate::migrate;
use microblog_core::models::{Post, User};
use microblog_core::posts;
use microblog_core::progress::NoProgress;
use microblog_core::registry::SearchableRegistry;
use microblog_core::search::memory::InMemoryBackend;
use microblog_core::search::sqlite::SqliteFtsBackend;
use microblog_core::search::{SearchBackend, SearchHits, SearchIndex};
use microblog_core::sync::IndexSync;

async fn open_db(tmp: &TempDir, index: SearchIndex) -> Database {
    let pool = db::connect_path(&tmp.path().join("mb.sqlite")).await.unwrap();
    migrate(&pool).await.unwrap();
    let sync = IndexSync::new(index, SearchableRegistry::with_defaults());
    Database::new(pool, Arc::new(sync))
}

async fn setup() -> (TempDir, Database, Arc<InMemoryBackend>) {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let index = SearchIndex::new(backend.clone(), Duration::from_secs(2));
    let db = open_db(&tmp, index).await;
    (tmp, db, backend)
}

async fn live_post_ids(db: &Database) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM posts ORDER BY id")
        .fetch_all(db.pool())
        .await
        .unwrap()
}

async fn user(db: &Database, name: &str) -> User {
    posts::create_user(db, name, &format!("{}@example.com", name))
        .await
        .unwrap()
}

async fn insert_post(uow: &mut microblog_core::uow::UnitOfWork, user_id: i64, body: &str) -> Post {
    sqlx::query_as(
        "INSERT INTO posts (body, timestamp, user_id) VALUES (?, 0, ?) \
         RETURNING id, body, timestamp, user_id, language",
    )
    .bind(body)
    .bind(user_id)
    .fetch_one(uow.conn())
    .await
    .unwrap()
}

#[tokio::test]
async fn index_matches_store_after_commits() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;

    let p1 = posts::create(&db, ann.id, "first post", None).await.unwrap();
    let p2 = posts::create(&db, ann.id, "second post", None).await.unwrap();
    let p3 = posts::create(&db, ann.id, "third post", None).await.unwrap();
    posts::edit(&db, p2.id, "second post, edited").await.unwrap();
    posts::delete(&db, p3.id).await.unwrap();

    assert_eq!(backend.ids("posts"), live_post_ids(&db).await);
    assert_eq!(
        backend.document("posts", p2.id).unwrap()["body"],
        json!("second post, edited")
    );

    // Several changes in one transaction
    let mut uow = db.begin().await.unwrap();
    let p4 = insert_post(&mut uow, ann.id, "fourth post").await;
    uow.added(&p4).unwrap();
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(p1.id)
        .execute(uow.conn())
        .await
        .unwrap();
    uow.deleted(&p1).unwrap();
    uow.commit().await.unwrap();

    assert_eq!(backend.ids("posts"), vec![p2.id, p4.id]);
    assert_eq!(backend.ids("posts"), live_post_ids(&db).await);
}

#[tokio::test]
async fn only_registered_tables_and_fields_are_indexed() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;
    let post = posts::create(&db, ann.id, "hello", Some("en")).await.unwrap();

    assert!(backend.ids("users").is_empty());
    let doc = backend.document("posts", post.id).unwrap();
    assert_eq!(doc.len(), 1);
    assert_eq!(doc["body"], json!("hello"));
}

#[tokio::test]
async fn rollback_never_touches_index() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;
    let before = backend.mutation_count();

    let mut uow = db.begin().await.unwrap();
    let post = insert_post(&mut uow, ann.id, "never committed").await;
    uow.added(&post).unwrap();
    uow.rollback().await.unwrap();

    // Dropping without commit behaves the same
    {
        let mut uow = db.begin().await.unwrap();
        let post = insert_post(&mut uow, ann.id, "dropped").await;
        uow.added(&post).unwrap();
    }

    assert_eq!(backend.mutation_count(), before);
    assert!(live_post_ids(&db).await.is_empty());
}

#[tokio::test]
async fn failed_commit_never_touches_index() {
    let (_tmp, db, backend) = setup().await;
    let before = backend.mutation_count();

    // user 999 does not exist; the deferred foreign key fails at COMMIT
    let mut uow = db.begin().await.unwrap();
    let post = insert_post(&mut uow, 999, "orphan").await;
    uow.added(&post).unwrap();
    assert!(uow.commit().await.is_err());

    assert_eq!(backend.mutation_count(), before);
    assert!(backend.ids("posts").is_empty());
    assert!(live_post_ids(&db).await.is_empty());
}

#[tokio::test]
async fn add_then_delete_in_one_transaction_is_invisible() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;
    let before = backend.mutation_count();

    let mut uow = db.begin().await.unwrap();
    let post = insert_post(&mut uow, ann.id, "blink").await;
    uow.added(&post).unwrap();
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(post.id)
        .execute(uow.conn())
        .await
        .unwrap();
    uow.deleted(&post).unwrap();
    assert!(uow.changes().is_empty());
    uow.commit().await.unwrap();

    assert_eq!(backend.mutation_count(), before);
}

#[tokio::test]
async fn disabled_search_returns_no_results() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp, SearchIndex::disabled()).await;
    let ann = user(&db, "ann").await;
    posts::create(&db, ann.id, "rust everywhere", None).await.unwrap();

    let page = posts::search(&db, "rust", 1, 10).await.unwrap();
    assert!(page.posts.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(page.next_page, None);
}

#[tokio::test]
async fn huge_page_numbers_do_not_overflow() {
    let (_tmp, db, _backend) = setup().await;
    let ann = user(&db, "ann").await;
    posts::create(&db, ann.id, "rust everywhere", None).await.unwrap();

    let err = posts::search(&db, "rust", i64::MAX, 10).await.unwrap_err();
    assert!(matches!(err, SearchError::PageOutOfRange(_)));

    // Last addressable page of size 1
    let page = posts::search(&db, "rust", i64::MAX, 1).await.unwrap();
    assert!(page.posts.is_empty());
    assert_eq!(page.total, 1);
    assert_eq!(page.next_page, None);
    assert_eq!(page.prev_page, Some(i64::MAX - 1));
}

#[tokio::test]
async fn reindex_rebuilds_from_store() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;

    // Written behind the hook's back, so the index starts empty
    let mut tx = db.pool().begin().await.unwrap();
    for i in 1..=1100 {
        let body = if i % 4 == 0 { "learning rust" } else { "other topic" };
        sqlx::query("INSERT INTO posts (body, timestamp, user_id) VALUES (?, ?, ?)")
            .bind(body)
            .bind(i as i64)
            .bind(ann.id)
            .execute(&mut *tx)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();
    assert!(backend.ids("posts").is_empty());

    let indexed = db
        .sync()
        .reindex_table(db.pool(), "posts", &NoProgress)
        .await
        .unwrap();
    assert_eq!(indexed, 1100);
    assert_eq!(backend.ids("posts"), live_post_ids(&db).await);

    let page = posts::search(&db, "rust", 1, 10).await.unwrap();
    assert_eq!(page.total, 275);
    assert_eq!(page.posts.len(), 10);
    assert!(page.posts.iter().all(|p| p.body == "learning rust"));
    assert_eq!(page.next_page, Some(2));

    // Running it again changes nothing
    db.sync()
        .reindex_table(db.pool(), "posts", &NoProgress)
        .await
        .unwrap();
    assert_eq!(backend.ids("posts").len(), 1100);
}

#[tokio::test]
async fn reindex_rejects_unsearchable_tables() {
    let (_tmp, db, _backend) = setup().await;
    let err = db
        .sync()
        .reindex_table(db.pool(), "users", &NoProgress)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("users"));
}

#[tokio::test]
async fn search_hydrates_in_index_order() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;
    let once = posts::create(&db, ann.id, "rust", None).await.unwrap();
    let thrice = posts::create(&db, ann.id, "rust rust rust", None).await.unwrap();
    let twice = posts::create(&db, ann.id, "rust and rust", None).await.unwrap();

    let page = posts::search(&db, "rust", 1, 10).await.unwrap();
    let ids: Vec<i64> = page.posts.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![thrice.id, twice.id, once.id]);
    assert_eq!(page.prev_page, None);

    let second = posts::search(&db, "rust", 2, 2).await.unwrap();
    assert_eq!(second.posts.len(), 1);
    assert_eq!(second.prev_page, Some(1));
    assert_eq!(second.next_page, None);

    // A stale index entry is skipped during hydration
    let doc = json!({ "body": "rust rust rust rust" });
    backend
        .index("posts", 9999, doc.as_object().unwrap())
        .await
        .unwrap();
    let page = posts::search(&db, "rust", 1, 10).await.unwrap();
    assert_eq!(page.posts.len(), 3);
    assert_eq!(page.total, 4);
}

#[tokio::test]
async fn outage_during_commit_is_repaired_by_reindex() {
    let (_tmp, db, backend) = setup().await;
    let ann = user(&db, "ann").await;

    backend.set_available(false);
    let post = posts::create(&db, ann.id, "written while search was down", None)
        .await
        .unwrap();
    assert!(posts::search(&db, "search", 1, 10)
        .await
        .unwrap_err()
        .is_unavailable());

    backend.set_available(true);
    assert!(backend.ids("posts").is_empty());
    db.sync()
        .reindex_table(db.pool(), "posts", &NoProgress)
        .await
        .unwrap();
    assert_eq!(backend.ids("posts"), vec![post.id]);
}

struct StalledBackend;

#[async_trait]
impl SearchBackend for StalledBackend {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn index(&self, _: &str, _: i64, _: &Map<String, Value>) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn remove(&self, _: &str, _: i64) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn query(&self, _: &str, _: &str, _: i64, _: i64) -> Result<SearchHits> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(SearchHits::empty())
    }
}

#[tokio::test]
async fn stalled_backend_is_bounded_by_timeout() {
    let tmp = TempDir::new().unwrap();
    let index = SearchIndex::new(Arc::new(StalledBackend), Duration::from_millis(100));
    let db = open_db(&tmp, index).await;
    let ann = user(&db, "ann").await;

    let started = Instant::now();
    let post = posts::create(&db, ann.id, "slow index", None).await.unwrap();
    posts::delete(&db, post.id).await.unwrap();
    let err = posts::search(&db, "slow", 1, 10).await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn sqlite_fts_backend_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteFtsBackend::open(&tmp.path().join("search.sqlite"))
        .await
        .unwrap();
    let index = SearchIndex::new(Arc::new(backend), Duration::from_secs(5));
    let db = open_db(&tmp, index).await;
    let ann = user(&db, "ann").await;

    let keep = posts::create(&db, ann.id, "async rust in practice", None)
        .await
        .unwrap();
    let gone = posts::create(&db, ann.id, "rust macros", None).await.unwrap();
    posts::create(&db, ann.id, "gardening tips", None).await.unwrap();
    posts::delete(&db, gone.id).await.unwrap();

    let page = posts::search(&db, "rust", 1, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.posts[0].id, keep.id);
}
