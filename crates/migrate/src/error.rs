//! Error types for the migration engine

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::definitions::MigrationDirection;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors raised while discovering, tracking or executing migrations
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to read migrations from '{}': {source}", .path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate migration name '{name}' ({} and {})", .first.display(), .second.display())]
    DuplicateMigration {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Invalid migration file '{}': {reason}", .path.display())]
    InvalidMigration { path: PathBuf, reason: String },

    #[error("Migration file already exists: {}", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Migration '{name}' failed ({direction}): {message}")]
    ScriptExecution {
        name: String,
        direction: MigrationDirection,
        message: String,
    },

    #[error("Migration '{name}' is already recorded as applied")]
    DuplicateApply { name: String },

    #[error("No applied migration record with id {id}")]
    NotFound { id: i64 },

    #[error("Migration tracker error: {message}")]
    Tracker { message: String },

    #[error("Migration lock unavailable after {timeout_ms}ms; another runner may be active")]
    LockUnavailable { timeout_ms: u64 },

    #[error("Migration lock error: {message}")]
    Lock { message: String },

    #[error("Rollback count must be positive, got {count}")]
    InvalidCount { count: i64 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MigrationError {
    pub(crate) fn tracker(context: &str, err: impl std::fmt::Display) -> Self {
        MigrationError::Tracker {
            message: format!("{}: {}", context, err),
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::Config(_) | MigrationError::InvalidCount { .. } => 2,
            MigrationError::Discovery { .. }
            | MigrationError::DuplicateMigration { .. }
            | MigrationError::InvalidMigration { .. }
            | MigrationError::AlreadyExists { .. } => 3,
            MigrationError::Connection { .. } => 4,
            MigrationError::LockUnavailable { .. } | MigrationError::Lock { .. } => 5,
            MigrationError::ScriptExecution { .. } => 6,
            MigrationError::DuplicateApply { .. }
            | MigrationError::NotFound { .. }
            | MigrationError::Tracker { .. } => 7,
        }
    }

    /// Name of the migration that failed, when the error is tied to one
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            MigrationError::ScriptExecution { name, .. }
            | MigrationError::DuplicateApply { name }
            | MigrationError::DuplicateMigration { name, .. } => Some(name),
            _ => None,
        }
    }
}
