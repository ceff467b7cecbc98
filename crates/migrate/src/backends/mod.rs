//! Database Backend Abstractions
//!
//! The tracker and engine talk to the database only through
//! [`MigrationBackend`], so the same engine drives PostgreSQL in production
//! and an in-memory backend in tests.

pub mod core;
pub mod postgres;

pub use self::core::*;
pub use self::postgres::PostgresBackend;
