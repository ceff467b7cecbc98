//! Core Database Backend Trait
//!
//! One live session per run: scripts, bookkeeping and the advisory lock all go
//! through the same backend value.

use async_trait::async_trait;

use crate::definitions::AppliedRecord;

/// Failure reported by a backend primitive, carrying the database's message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::new(err.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Primitive operations the migration engine needs from a database session
#[async_trait]
pub trait MigrationBackend: Send {
    /// Execute a whole script segment, which may hold several statements
    async fn execute_script(&mut self, sql: &str) -> BackendResult<()>;

    /// Whether the tracker table exists
    async fn tracker_exists(&mut self, table: &str) -> BackendResult<bool>;

    /// Create the tracker table if it is absent
    async fn create_tracker(&mut self, table: &str) -> BackendResult<()>;

    /// All tracker rows, ascending by id
    async fn fetch_applied(&mut self, table: &str) -> BackendResult<Vec<AppliedRecord>>;

    /// Insert a tracker row stamped with the current time
    async fn insert_applied(&mut self, table: &str, name: &str) -> BackendResult<AppliedRecord>;

    /// Delete a tracker row, returning the number of rows removed
    async fn delete_applied(&mut self, table: &str, id: i64) -> BackendResult<u64>;

    /// Try to take the session-level advisory lock without blocking
    async fn try_lock(&mut self, key: i64) -> BackendResult<bool>;

    /// Release the advisory lock; false when it was not held
    async fn unlock(&mut self, key: i64) -> BackendResult<bool>;

    /// Close the session
    async fn close(self: Box<Self>) -> BackendResult<()>;
}
