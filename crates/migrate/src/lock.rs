//! Advisory lock serializing concurrent runners against one database
//!
//! The lock is session-scoped, so it lives on the same backend that executes
//! the scripts and is dropped by the server if the process dies.

use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::backends::MigrationBackend;
use crate::error::{MigrationError, MigrationResult};

const LOCK_KEY_NAMESPACE: u64 = 0x5354_4557_4152_4421;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Stable lock key for a tracker table (FNV-1a, namespaced)
pub fn lock_key(table: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in table.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash ^ LOCK_KEY_NAMESPACE) as i64
}

/// Poll for the lock until `timeout` elapses
pub async fn acquire<B: MigrationBackend + ?Sized>(
    backend: &mut B,
    key: i64,
    timeout: Duration,
) -> MigrationResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        let locked = backend.try_lock(key).await.map_err(|e| MigrationError::Lock {
            message: format!("pg_try_advisory_lock failed: {}", e),
        })?;
        if locked {
            tracing::debug!(key, "migration lock acquired");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(MigrationError::LockUnavailable {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        tracing::debug!(key, "migration lock busy, waiting");
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn release<B: MigrationBackend + ?Sized>(
    backend: &mut B,
    key: i64,
) -> MigrationResult<()> {
    match backend.unlock(key).await {
        Ok(true) => {
            tracing::debug!(key, "migration lock released");
            Ok(())
        }
        Ok(false) => Err(MigrationError::Lock {
            message: "pg_advisory_unlock returned false".to_string(),
        }),
        Err(e) => Err(MigrationError::Lock {
            message: format!("pg_advisory_unlock failed: {}", e),
        }),
    }
}
