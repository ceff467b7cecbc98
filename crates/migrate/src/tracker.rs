//! Applied-Set Tracker - bookkeeping table inside the target database
//!
//! Records are append/delete only. Every operation runs on the backend passed
//! in, which is the same session that executes the migration scripts.

use crate::backends::MigrationBackend;
use crate::definitions::AppliedRecord;
use crate::error::{MigrationError, MigrationResult};

/// Outcome of [`Tracker::ensure_initialized`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// The table was already there
    Existing,
    /// The table was missing and has just been created
    Created,
}

/// Durable record of applied migrations
#[derive(Debug, Clone)]
pub struct Tracker {
    table: String,
}

impl Tracker {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn exists<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> MigrationResult<bool> {
        backend
            .tracker_exists(&self.table)
            .await
            .map_err(|e| MigrationError::tracker("failed to check migrations table", e))
    }

    /// Create the table if absent; safe to call on every run
    pub async fn ensure_initialized<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> MigrationResult<TrackerState> {
        if self.exists(backend).await? {
            return Ok(TrackerState::Existing);
        }

        backend
            .create_tracker(&self.table)
            .await
            .map_err(|e| MigrationError::tracker("failed to create migrations table", e))?;
        tracing::info!(table = %self.table, "created migrations table");
        Ok(TrackerState::Created)
    }

    /// Applied records in ascending id order
    pub async fn list_applied<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> MigrationResult<Vec<AppliedRecord>> {
        let mut records = backend
            .fetch_applied(&self.table)
            .await
            .map_err(|e| MigrationError::tracker("failed to query applied migrations", e))?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    pub async fn is_applied<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
        name: &str,
    ) -> MigrationResult<bool> {
        Ok(self
            .list_applied(backend)
            .await?
            .iter()
            .any(|r| r.name == name))
    }

    pub async fn record_applied<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
        name: &str,
    ) -> MigrationResult<AppliedRecord> {
        if self.is_applied(backend, name).await? {
            return Err(MigrationError::DuplicateApply {
                name: name.to_string(),
            });
        }

        let record = backend
            .insert_applied(&self.table, name)
            .await
            .map_err(|e| MigrationError::tracker("failed to record migration", e))?;
        tracing::debug!(id = record.id, name = %record.name, "recorded migration");
        Ok(record)
    }

    pub async fn record_reverted<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
        id: i64,
    ) -> MigrationResult<()> {
        let removed = backend
            .delete_applied(&self.table, id)
            .await
            .map_err(|e| MigrationError::tracker("failed to remove migration record", e))?;
        if removed == 0 {
            return Err(MigrationError::NotFound { id });
        }
        tracing::debug!(id, "removed migration record");
        Ok(())
    }
}
