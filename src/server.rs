//! JSON HTTP API.
//!
//! Exposes the write paths, hydrated search, the notification outbox, and the
//! task ledger over HTTP. Identity is taken from the path or body; there is
//! no session layer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version and search backend) |
//! | `POST` | `/users` | Create a user |
//! | `POST` | `/posts` | Create a post |
//! | `PUT`  | `/posts/{id}` | Edit a post |
//! | `DELETE` | `/posts/{id}` | Delete a post |
//! | `GET`  | `/search?q=&page=` | Search posts |
//! | `POST` | `/messages` | Send a private message |
//! | `POST` | `/users/{id}/messages/read` | Mark messages read |
//! | `GET`  | `/users/{id}/notifications?since=` | Poll notifications |
//! | `POST` | `/users/{id}/export_posts` | Launch a post export |
//! | `GET`  | `/users/{id}/tasks` | Open tasks with progress |
//! | `GET`  | `/tasks/{id}` | One task with progress |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "search_unavailable", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `search_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db::Database;
use crate::error::SearchError;
use crate::export::EXPORT_POSTS;
use crate::models::{Message, Post, User};
use crate::outbox::{self, NotificationView};
use crate::posts::{self, PostPage};
use crate::queue::{JobQueue, SqliteJobQueue};
use crate::tasks::{self, TaskProgress};
use crate::messages;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    db: Database,
    queue: Arc<dyn JobQueue>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Database, queue: Arc<dyn JobQueue>, config: Config) -> Self {
        Self {
            db,
            queue,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/users", post(handle_create_user))
        .route("/posts", post(handle_create_post))
        .route("/posts/{id}", put(handle_edit_post).delete(handle_delete_post))
        .route("/search", get(handle_search))
        .route("/messages", post(handle_send_message))
        .route("/users/{id}/messages/read", post(handle_mark_read))
        .route("/users/{id}/notifications", get(handle_notifications))
        .route("/users/{id}/export_posts", post(handle_export_posts))
        .route("/users/{id}/tasks", get(handle_user_tasks))
        .route("/tasks/{id}", get(handle_task))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let db = Database::open(config).await?;
    let queue = SqliteJobQueue::open(&config.queue).await?;
    let bind_addr = config.server.bind.clone();
    let state = AppState::new(db, Arc::new(queue), config.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        bind = %bind_addr,
        search = state.db.index().backend_name(),
        "server listening"
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn conflict(message: impl Into<String>) -> AppError {
    app_error(StatusCode::CONFLICT, "conflict", message)
}

/// Maps store errors to client errors where the cause is the request's data
/// (duplicate usernames, references to missing users).
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let msg = format!("{:#}", err);
        let db_error = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<sqlx::Error>())
            .and_then(|e| e.as_database_error());
        match db_error {
            Some(e) if e.is_unique_violation() => conflict(msg),
            Some(e) if e.is_foreign_key_violation() => {
                bad_request(format!("unknown user reference: {}", msg))
            }
            _ => {
                tracing::error!(error = %msg, "request failed");
                app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        }
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Unavailable(_) => app_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "search_unavailable",
                err.to_string(),
            ),
            SearchError::PageOutOfRange(_) => bad_request(err.to_string()),
            SearchError::Database(e) => anyhow::Error::from(e).into(),
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(bad_request(format!("{} must not be empty", field)));
    }
    Ok(())
}

async fn require_user(state: &AppState, id: i64) -> Result<User, AppError> {
    posts::get_user(state.db.pool(), id)
        .await?
        .ok_or_else(|| not_found(format!("user not found: {}", id)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    search: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        search: state.db.index().backend_name().to_string(),
    })
}

// ============ Users and posts ============

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    email: String,
}

async fn handle_create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    require_text("username", &req.username)?;
    require_text("email", &req.email)?;
    let user = posts::create_user(&state.db, req.username.trim(), req.email.trim()).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
struct CreatePostRequest {
    user_id: i64,
    body: String,
    #[serde(default)]
    language: Option<String>,
}

async fn handle_create_post(
    State(state): State<AppState>,
    Json(req): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), AppError> {
    require_text("body", &req.body)?;
    let post = posts::create(&state.db, req.user_id, &req.body, req.language.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

#[derive(Deserialize)]
struct EditPostRequest {
    body: String,
}

async fn handle_edit_post(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<EditPostRequest>,
) -> Result<Json<Post>, AppError> {
    require_text("body", &req.body)?;
    posts::edit(&state.db, id, &req.body)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("post not found: {}", id)))
}

async fn handle_delete_post(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Post>, AppError> {
    posts::delete(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("post not found: {}", id)))
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    page: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<PostPage>, AppError> {
    require_text("q", &params.q)?;
    let page = posts::search(
        &state.db,
        &params.q,
        params.page.unwrap_or(1),
        state.config.search.per_page,
    )
    .await?;
    Ok(Json(page))
}

// ============ Messages and notifications ============

#[derive(Deserialize)]
struct SendMessageRequest {
    sender_id: i64,
    recipient_id: i64,
    body: String,
}

async fn handle_send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    require_text("body", &req.body)?;
    require_user(&state, req.recipient_id).await?;
    let message = messages::send(&state.db, req.sender_id, req.recipient_id, &req.body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn handle_mark_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    messages::mark_read(&state.db, id)
        .await?
        .ok_or_else(|| not_found(format!("user not found: {}", id)))?;
    Ok(Json(json!({ "unread_message_count": 0 })))
}

#[derive(Deserialize)]
struct PollParams {
    #[serde(default)]
    since: f64,
}

async fn handle_notifications(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PollParams>,
) -> Result<Json<Vec<NotificationView>>, AppError> {
    let notifications = outbox::poll(state.db.pool(), id, params.since).await?;
    Ok(Json(notifications))
}

// ============ Tasks ============

async fn handle_export_posts(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<TaskProgress>), AppError> {
    require_user(&state, id).await?;
    if let Some(task) = tasks::in_progress(state.db.pool(), id, EXPORT_POSTS).await? {
        return Err(conflict(format!(
            "an export task is already in progress: {}",
            task.id
        )));
    }

    let mut uow = state.db.begin().await?;
    let task = tasks::launch(
        uow.conn(),
        state.queue.as_ref(),
        id,
        EXPORT_POSTS,
        "Exporting posts...",
        json!([]),
    )
    .await?;
    uow.commit().await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskProgress { task, progress: 0 }),
    ))
}

async fn handle_user_tasks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TaskProgress>>, AppError> {
    let open = tasks::all_in_progress(state.db.pool(), id).await?;
    let mut out = Vec::with_capacity(open.len());
    for task in open {
        out.push(tasks::with_progress(state.queue.as_ref(), task).await);
    }
    Ok(Json(out))
}

async fn handle_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskProgress>, AppError> {
    let task = tasks::get(state.db.pool(), &id)
        .await?
        .ok_or_else(|| not_found(format!("task not found: {}", id)))?;
    Ok(Json(tasks::with_progress(state.queue.as_ref(), task).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn store_constraint_errors_map_to_client_errors() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for sql in [
            "PRAGMA foreign_keys = ON",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT UNIQUE)",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id))",
            "INSERT INTO users (username) VALUES ('ann')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }

        let duplicate = sqlx::query("INSERT INTO users (username) VALUES ('ann')")
            .execute(&pool)
            .await
            .unwrap_err();
        let err = AppError::from(anyhow::Error::from(duplicate).context("creating user"));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "conflict");

        let orphan = sqlx::query("INSERT INTO posts (user_id) VALUES (99)")
            .execute(&pool)
            .await
            .unwrap_err();
        let err = AppError::from(anyhow::Error::from(orphan));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn constraint_wording_outside_the_store_is_internal() {
        let err = AppError::from(anyhow::anyhow!("UNIQUE constraint failed: users.username"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "internal");
    }
}
