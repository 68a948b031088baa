//! User and post write paths, and hydrated post search.
//!
//! Every write goes through a [`UnitOfWork`](crate::uow::UnitOfWork) and
//! records the row it touched, so the search index follows the store without
//! these functions knowing which tables are searchable.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::db::Database;
use crate::error::SearchError;
use crate::models::{now_millis, Entity, Post, User};

const POST_COLUMNS: &str = "id, body, timestamp, user_id, language";

/// One page of search results, in relevance order.
#[derive(Debug, Clone, Serialize)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub total: i64,
    pub page: i64,
    pub next_page: Option<i64>,
    pub prev_page: Option<i64>,
}

pub async fn create_user(db: &Database, username: &str, email: &str) -> Result<User> {
    let mut uow = db.begin().await?;
    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (username, email, last_seen)
        VALUES (?, ?, ?)
        RETURNING id, username, email, about_me, last_seen, last_message_read_time
        "#,
    )
    .bind(username)
    .bind(email)
    .bind(now_millis())
    .fetch_one(uow.conn())
    .await?;
    uow.added(&user)?;
    uow.commit().await?;
    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as(
        "SELECT id, username, email, about_me, last_seen, last_message_read_time \
         FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn create(
    db: &Database,
    user_id: i64,
    body: &str,
    language: Option<&str>,
) -> Result<Post> {
    let mut uow = db.begin().await?;
    let post: Post = sqlx::query_as(&format!(
        "INSERT INTO posts (body, timestamp, user_id, language) VALUES (?, ?, ?, ?) RETURNING {}",
        POST_COLUMNS
    ))
    .bind(body)
    .bind(now_millis())
    .bind(user_id)
    .bind(language)
    .fetch_one(uow.conn())
    .await?;
    uow.added(&post)?;
    uow.commit().await?;
    Ok(post)
}

/// Replaces the body of post `id`. `None` if it does not exist.
pub async fn edit(db: &Database, id: i64, body: &str) -> Result<Option<Post>> {
    let mut uow = db.begin().await?;
    let post: Option<Post> = sqlx::query_as(&format!(
        "UPDATE posts SET body = ? WHERE id = ? RETURNING {}",
        POST_COLUMNS
    ))
    .bind(body)
    .bind(id)
    .fetch_optional(uow.conn())
    .await?;

    let Some(post) = post else {
        uow.rollback().await?;
        return Ok(None);
    };
    uow.updated(&post)?;
    uow.commit().await?;
    Ok(Some(post))
}

/// Deletes post `id` and returns the removed row. `None` if it did not exist.
pub async fn delete(db: &Database, id: i64) -> Result<Option<Post>> {
    let mut uow = db.begin().await?;
    let post: Option<Post> = sqlx::query_as(&format!(
        "DELETE FROM posts WHERE id = ? RETURNING {}",
        POST_COLUMNS
    ))
    .bind(id)
    .fetch_optional(uow.conn())
    .await?;

    let Some(post) = post else {
        uow.rollback().await?;
        return Ok(None);
    };
    uow.deleted(&post)?;
    uow.commit().await?;
    Ok(Some(post))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Post>> {
    let post = sqlx::query_as(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(post)
}

/// Ranks posts with the search index, then loads them from the store in the
/// index's order. Ids the store no longer has are skipped.
pub async fn search(
    db: &Database,
    text: &str,
    page: i64,
    per_page: i64,
) -> Result<PostPage, SearchError> {
    let page = page.max(1);
    let hits = db.index().query(Post::TABLE, text, page, per_page).await?;
    let posts = hydrate(db.pool(), &hits.ids).await?;
    let next_page = match page.checked_mul(per_page) {
        Some(seen) if hits.total > seen => page.checked_add(1),
        _ => None,
    };

    Ok(PostPage {
        posts,
        total: hits.total,
        page,
        next_page,
        prev_page: (page > 1).then_some(page - 1),
    })
}

async fn hydrate(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<Post>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM posts WHERE id IN ({})",
        POST_COLUMNS, placeholders
    );
    let mut query = sqlx::query_as::<_, Post>(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id: HashMap<i64, Post> = rows.into_iter().map(|p| (p.id, p)).collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}
