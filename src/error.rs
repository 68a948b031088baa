use thiserror::Error;

/// Failure of a search query.
///
/// `Unavailable` is distinct from an empty result: the backend is
/// configured but could not answer, and the caller has no other data source.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search unavailable: {0}")]
    Unavailable(String),

    /// The requested page lies beyond any offset the backend can address.
    #[error("page {0} is out of range")]
    PageOutOfRange(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SearchError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SearchError::Unavailable(_))
    }
}
