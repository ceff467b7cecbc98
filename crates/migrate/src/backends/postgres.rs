//! PostgreSQL Backend Implementation
//!
//! Runs on a single `PgConnection`. Script segments go through the simple
//! query protocol (no bind arguments), which accepts several statements at
//! once and leaves `$$`-quoted bodies untouched.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Row};
use std::str::FromStr;

use super::core::{BackendError, BackendResult, MigrationBackend};
use crate::config::MigrationConfig;
use crate::definitions::AppliedRecord;
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL session used for one migration run
pub struct PostgresBackend {
    conn: PgConnection,
}

impl PostgresBackend {
    /// Open the session described by `config`, applying the statement timeout
    pub async fn connect(config: &MigrationConfig) -> MigrationResult<Self> {
        let options = Self::connect_options(config)?;

        let connect = PgConnection::connect_with(&options);
        let conn = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| MigrationError::Connection {
                message: format!(
                    "timed out after {}s connecting to {}",
                    config.connect_timeout.as_secs(),
                    config.target_description()
                ),
            })?
            .map_err(|e| MigrationError::Connection {
                message: format!("{}: {}", config.target_description(), e),
            })?;

        let mut backend = Self { conn };

        if let Some(timeout) = config.statement_timeout {
            let sql = format!("SET statement_timeout = {}", timeout.as_millis());
            backend
                .conn
                .execute(sql.as_str())
                .await
                .map_err(|e| MigrationError::Connection {
                    message: format!("failed to set statement_timeout: {}", e),
                })?;
        }

        tracing::debug!(target = %config.target_description(), "database session opened");
        Ok(backend)
    }

    /// Build connection options from the URL, or from the discrete fields
    pub fn connect_options(config: &MigrationConfig) -> MigrationResult<PgConnectOptions> {
        if let Some(url) = &config.database_url {
            return PgConnectOptions::from_str(url).map_err(|e| MigrationError::Connection {
                message: format!("invalid DATABASE_URL: {}", e),
            });
        }

        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Wrap an already-open connection
    pub fn from_connection(conn: PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    async fn execute_script(&mut self, sql: &str) -> BackendResult<()> {
        self.conn.execute(sql).await?;
        Ok(())
    }

    async fn tracker_exists(&mut self, table: &str) -> BackendResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(exists)
    }

    async fn create_tracker(&mut self, table: &str) -> BackendResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id BIGSERIAL PRIMARY KEY,\n    \
                name VARCHAR(255) NOT NULL,\n    \
                executed_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
            )",
            table
        );
        self.conn.execute(sql.as_str()).await?;
        Ok(())
    }

    async fn fetch_applied(&mut self, table: &str) -> BackendResult<Vec<AppliedRecord>> {
        let sql = format!("SELECT id, name, executed_at FROM {} ORDER BY id ASC", table);
        let rows = sqlx::query(&sql).fetch_all(&mut self.conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(AppliedRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                executed_at: row.try_get("executed_at")?,
            });
        }
        Ok(records)
    }

    async fn insert_applied(&mut self, table: &str, name: &str) -> BackendResult<AppliedRecord> {
        let sql = format!(
            "INSERT INTO {} (name, executed_at) VALUES ($1, now()) RETURNING id, name, executed_at",
            table
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_one(&mut self.conn)
            .await?;

        Ok(AppliedRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            executed_at: row.try_get("executed_at")?,
        })
    }

    async fn delete_applied(&mut self, table: &str, id: i64) -> BackendResult<u64> {
        let sql = format!("DELETE FROM {} WHERE id = $1", table);
        let result = sqlx::query(&sql).bind(id).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn try_lock(&mut self, key: i64) -> BackendResult<bool> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(locked)
    }

    async fn unlock(&mut self, key: i64) -> BackendResult<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn close(self: Box<Self>) -> BackendResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| BackendError::new(format!("failed to close connection: {}", e)))
    }
}
