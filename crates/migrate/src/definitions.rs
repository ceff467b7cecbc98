//! Migration Definitions - Core types shared by the migration system
//!
//! Defines the migration unit read from disk, the bookkeeping record stored in
//! the tracker table, and the reports returned by apply/revert runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::error::{MigrationError, MigrationResult};

/// One versioned change unit read from the migrations directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Unique identifier, the file stem (e.g. `20240101120000_create_users`)
    pub name: String,
    /// Path the migration was read from
    pub path: PathBuf,
    /// Forward SQL, never empty
    pub up_script: String,
    /// Reverse SQL; `None` marks a forward-only migration
    pub down_script: Option<String>,
}

impl MigrationFile {
    /// Whether the migration can only be reverted at the bookkeeping level
    pub fn is_forward_only(&self) -> bool {
        self.down_script.is_none()
    }
}

/// A row of the tracker table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    /// Monotonic id assigned by the database, never reused
    pub id: i64,
    /// Name of the applied migration
    pub name: String,
    /// When the up script completed
    pub executed_at: DateTime<Utc>,
}

/// Direction a migration script runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Run the up segment
    Up,
    /// Run the down segment
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Number of migrations a rollback reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackCount(usize);

impl RollbackCount {
    /// Permissive normalization: zero and negative counts become 1
    pub fn new(count: i64) -> Self {
        if count < 1 {
            Self(1)
        } else {
            Self(usize::try_from(count).unwrap_or(usize::MAX))
        }
    }

    /// Strict construction for embedders that want non-positive counts rejected
    pub fn strict(count: i64) -> MigrationResult<Self> {
        if count < 1 {
            return Err(MigrationError::InvalidCount { count });
        }
        Ok(Self::new(count))
    }

    /// Parse a CLI argument; absent or non-numeric input falls back to 1.
    /// Positive values too large for `i64` saturate to "everything applied".
    pub fn from_arg(arg: Option<&str>) -> Self {
        let Some(raw) = arg.map(str::trim) else {
            return Self::default();
        };
        match raw.parse::<i64>() {
            Ok(count) => Self::new(count),
            Err(_) if is_unsigned_integer(raw) => Self(usize::MAX),
            Err(_) => Self::default(),
        }
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

fn is_unsigned_integer(raw: &str) -> bool {
    let digits = raw.strip_prefix('+').unwrap_or(raw);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

impl Default for RollbackCount {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for RollbackCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of an apply run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Names applied in this run, in execution order
    pub applied: Vec<String>,
    /// Number of migrations already recorded before the run
    pub skipped: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Result of a revert run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevertReport {
    /// Names whose records were removed, most recent first
    pub reverted: Vec<String>,
    /// Reverted names that had no down script to execute
    pub forward_only: Vec<String>,
    /// Reverted names whose migration file no longer exists
    pub missing_files: Vec<String>,
    /// The tracker table did not exist when the run started
    pub nothing_to_revert: bool,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl RevertReport {
    pub fn reverted_count(&self) -> usize {
        self.reverted.len()
    }
}

/// Status of a single migration as seen by `status`
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    /// The tracker record, if the migration is applied
    pub applied: Option<AppliedRecord>,
    /// False when the tracker has a record but the file is gone
    pub file_present: bool,
    pub forward_only: bool,
}

impl MigrationStatus {
    pub fn is_pending(&self) -> bool {
        self.applied.is_none()
    }
}
