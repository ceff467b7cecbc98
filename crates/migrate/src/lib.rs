//! # steward-migrate: ordered SQL migrations
//!
//! Discovers timestamp-ordered `.sql` files, records which ones have run in a
//! tracker table inside the target database, and applies ("migrate") or
//! reverts ("rollback") them one at a time on a single session.
//!
//! ```no_run
//! use steward_migrate::{MigrationConfig, Migrator};
//!
//! # async fn run() -> steward_migrate::MigrationResult<()> {
//! let config = MigrationConfig::from_env()?;
//! let mut migrator = Migrator::connect(&config).await?;
//! let report = migrator.apply().await;
//! migrator.close().await?;
//! println!("applied {}", report?.applied_count());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod lock;
pub mod parser;
pub mod repository;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use backends::{BackendError, BackendResult, MigrationBackend, PostgresBackend};
pub use config::{ConfigError, MigrationConfig};
pub use definitions::*;
pub use engine::Migrator;
pub use error::{MigrationError, MigrationResult};
pub use parser::{has_statements, parse_segments, Segments, DOWN_DELIMITER};
pub use repository::ScriptRepository;
pub use tracker::{Tracker, TrackerState};
