//! Execution Engine - applies and reverts migrations
//!
//! A [`Migrator`] owns one backend session for its whole life. Runs are
//! strictly sequential and fail fast: the first failing script stops the run,
//! and everything recorded before it stays recorded.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::backends::{MigrationBackend, PostgresBackend};
use crate::config::MigrationConfig;
use crate::definitions::{
    ApplyReport, MigrationDirection, MigrationFile, MigrationStatus, RevertReport, RollbackCount,
};
use crate::error::{MigrationError, MigrationResult};
use crate::lock;
use crate::repository::ScriptRepository;
use crate::tracker::{Tracker, TrackerState};

#[derive(Debug, Clone, Copy)]
struct LockSettings {
    key: i64,
    timeout: Duration,
}

/// Migration runner bound to one database session
pub struct Migrator<B: MigrationBackend> {
    repository: ScriptRepository,
    tracker: Tracker,
    backend: B,
    lock: Option<LockSettings>,
}

impl Migrator<PostgresBackend> {
    /// Validate `config` and open a PostgreSQL session for it
    pub async fn connect(config: &MigrationConfig) -> MigrationResult<Self> {
        config.validate()?;
        let backend = PostgresBackend::connect(config).await?;
        Ok(Self::new(config, backend))
    }
}

impl<B: MigrationBackend> Migrator<B> {
    pub fn new(config: &MigrationConfig, backend: B) -> Self {
        let lock = config.lock.then(|| LockSettings {
            key: lock::lock_key(&config.migrations_table),
            timeout: config.lock_timeout,
        });

        Self {
            repository: ScriptRepository::new(config.migrations_dir.clone()),
            tracker: Tracker::new(config.migrations_table.clone()),
            backend,
            lock,
        }
    }

    /// Release the session
    pub async fn close(self) -> MigrationResult<()> {
        Box::new(self.backend)
            .close()
            .await
            .map_err(|e| MigrationError::Connection { message: e.message })
    }

    /// Apply every pending migration in ascending name order
    pub async fn apply(&mut self) -> MigrationResult<ApplyReport> {
        self.acquire_lock().await?;
        let result = self.apply_pending().await;
        self.release_lock(result).await
    }

    /// Revert the `count` most recently applied migrations
    pub async fn revert(&mut self, count: RollbackCount) -> MigrationResult<RevertReport> {
        self.acquire_lock().await?;
        let result = self.revert_latest(count).await;
        self.release_lock(result).await
    }

    /// Every known migration with its applied record, ordered by name
    ///
    /// Does not create the tracker table.
    pub async fn status(&mut self) -> MigrationResult<Vec<MigrationStatus>> {
        let migrations = self.repository.list()?;
        let applied = if self.tracker.exists(&mut self.backend).await? {
            self.tracker.list_applied(&mut self.backend).await?
        } else {
            Vec::new()
        };

        let mut by_name: HashMap<String, _> =
            applied.into_iter().map(|r| (r.name.clone(), r)).collect();

        let mut statuses: Vec<MigrationStatus> = migrations
            .into_iter()
            .map(|m| MigrationStatus {
                applied: by_name.remove(&m.name),
                forward_only: m.is_forward_only(),
                name: m.name,
                file_present: true,
            })
            .collect();

        statuses.extend(by_name.into_values().map(|record| MigrationStatus {
            name: record.name.clone(),
            applied: Some(record),
            file_present: false,
            forward_only: true,
        }));
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    async fn apply_pending(&mut self) -> MigrationResult<ApplyReport> {
        let start_time = Instant::now();

        self.tracker.ensure_initialized(&mut self.backend).await?;

        let migrations = self.repository.list()?;
        let applied = self.tracker.list_applied(&mut self.backend).await?;
        let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();

        let mut pending: Vec<&MigrationFile> = Vec::new();
        let mut skipped = 0;
        for migration in &migrations {
            if applied_names.contains(migration.name.as_str()) {
                tracing::info!(migration = %migration.name, "already applied, skipped");
                skipped += 1;
            } else {
                pending.push(migration);
            }
        }

        let mut report = ApplyReport {
            skipped,
            ..ApplyReport::default()
        };

        for migration in pending {
            tracing::info!(migration = %migration.name, "applying migration");

            self.backend
                .execute_script(&migration.up_script)
                .await
                .map_err(|e| MigrationError::ScriptExecution {
                    name: migration.name.clone(),
                    direction: MigrationDirection::Up,
                    message: e.message,
                })?;

            self.tracker
                .record_applied(&mut self.backend, &migration.name)
                .await?;
            report.applied.push(migration.name.clone());
        }

        report.execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            applied = report.applied_count(),
            skipped = report.skipped,
            elapsed_ms = report.execution_time_ms as u64,
            "migrate finished"
        );
        Ok(report)
    }

    async fn revert_latest(&mut self, count: RollbackCount) -> MigrationResult<RevertReport> {
        let start_time = Instant::now();
        let mut report = RevertReport::default();

        if self.tracker.ensure_initialized(&mut self.backend).await? == TrackerState::Created {
            tracing::info!("migrations table did not exist, nothing to roll back");
            report.nothing_to_revert = true;
            report.execution_time_ms = start_time.elapsed().as_millis();
            return Ok(report);
        }

        let applied = self.tracker.list_applied(&mut self.backend).await?;
        if applied.is_empty() {
            tracing::info!("no applied migrations, nothing to roll back");
            report.nothing_to_revert = true;
            report.execution_time_ms = start_time.elapsed().as_millis();
            return Ok(report);
        }

        let files: HashMap<String, MigrationFile> = self
            .repository
            .list()?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        for record in applied.iter().rev().take(count.get()) {
            match files.get(&record.name).and_then(|m| m.down_script.as_deref()) {
                Some(down_script) => {
                    tracing::info!(migration = %record.name, "reverting migration");
                    self.backend
                        .execute_script(down_script)
                        .await
                        .map_err(|e| MigrationError::ScriptExecution {
                            name: record.name.clone(),
                            direction: MigrationDirection::Down,
                            message: e.message,
                        })?;
                }
                None if files.contains_key(&record.name) => {
                    tracing::warn!(
                        migration = %record.name,
                        "no down script for migration, skipping execution"
                    );
                    report.forward_only.push(record.name.clone());
                }
                None => {
                    tracing::warn!(
                        migration = %record.name,
                        "migration file not found, removing record without executing a down script"
                    );
                    report.missing_files.push(record.name.clone());
                }
            }

            self.tracker
                .record_reverted(&mut self.backend, record.id)
                .await?;
            report.reverted.push(record.name.clone());
        }

        report.execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            reverted = report.reverted_count(),
            requested = count.get(),
            elapsed_ms = report.execution_time_ms as u64,
            "rollback finished"
        );
        Ok(report)
    }

    async fn acquire_lock(&mut self) -> MigrationResult<()> {
        match self.lock {
            Some(settings) => {
                lock::acquire(&mut self.backend, settings.key, settings.timeout).await
            }
            None => Ok(()),
        }
    }

    /// Release the lock on every exit path, keeping the run's own error first
    async fn release_lock<T>(&mut self, result: MigrationResult<T>) -> MigrationResult<T> {
        let Some(settings) = self.lock else {
            return result;
        };

        match (result, lock::release(&mut self.backend, settings.key).await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(unlock_err)) => Err(unlock_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(unlock_err)) => {
                tracing::warn!(error = %unlock_err, "failed to release migration lock");
                Err(err)
            }
        }
    }
}
