//! Migration configuration
//!
//! Connection parameters and engine settings are collected into one explicit
//! [`MigrationConfig`] that is handed to the engine. Nothing is read from
//! ambient global state after construction, so several engines can target
//! different databases inside one process.

use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

static TABLE_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("table identifier pattern is valid")
});

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Missing required configuration: {field} ({hint})")]
    MissingRequired { field: String, hint: String },
}

/// Settings for one migration engine instance
#[derive(Clone)]
pub struct MigrationConfig {
    /// Full connection URL; when set it takes precedence over the discrete fields
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Directory holding the `.sql` migration files
    pub migrations_dir: PathBuf,
    /// Tracker table, optionally schema-qualified
    pub migrations_table: String,
    pub connect_timeout: Duration,
    /// Per-statement limit applied to the session; `None` disables it
    pub statement_timeout: Option<Duration>,
    /// How long to wait for the advisory lock before giving up
    pub lock_timeout: Duration,
    /// Take the advisory lock around every run
    pub lock: bool,
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "migrations".to_string(),
            connect_timeout: Duration::from_secs(10),
            statement_timeout: None,
            lock_timeout: Duration::from_secs(30),
            lock: true,
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        if let Some(host) = lookup("DB_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            config.port = parse_field("port", &port, "valid port number (1-65535)")?;
        }
        if let Some(user) = lookup("DB_USER") {
            config.user = user;
        }
        config.password = lookup("DB_PASSWORD");
        if let Some(database) = lookup("DB_NAME") {
            config.database = database;
        }

        if let Some(dir) = lookup("MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }
        if let Some(table) = lookup("MIGRATIONS_TABLE") {
            config.migrations_table = table;
        }

        if let Some(secs) = lookup("DB_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = parse_field("connect_timeout", &secs, "whole number of seconds")?;
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = lookup("DB_STATEMENT_TIMEOUT_MS") {
            let ms: u64 = parse_field("statement_timeout", &ms, "whole number of milliseconds")?;
            config.statement_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(secs) = lookup("MIGRATIONS_LOCK_TIMEOUT_SECS") {
            let secs: u64 = parse_field("lock_timeout", &secs, "whole number of seconds")?;
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(lock) = lookup("MIGRATIONS_LOCK") {
            config.lock = parse_bool("lock", &lock)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_none() && self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: self.port.to_string(),
                expected: "port between 1 and 65535".to_string(),
            });
        }

        if !TABLE_IDENTIFIER.is_match(&self.migrations_table) {
            return Err(ConfigError::InvalidValue {
                field: "migrations_table".to_string(),
                value: self.migrations_table.clone(),
                expected: "SQL identifier such as 'migrations' or 'public.migrations'".to_string(),
            });
        }

        if self.migrations_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "migrations_dir".to_string(),
                hint: "set MIGRATIONS_DIR or pass --migrations-dir".to_string(),
            });
        }

        Ok(())
    }

    /// Connection target without credentials, for log lines
    pub fn target_description(&self) -> String {
        match &self.database_url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MigrationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("migrations_dir", &self.migrations_dir)
            .field("migrations_table", &self.migrations_table)
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock", &self.lock)
            .finish()
    }
}

fn parse_field<T: FromStr>(field: &str, value: &str, expected: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    })
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: "true or false".to_string(),
        }),
    }
}
