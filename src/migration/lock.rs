//! Advisory-lock based serialization of migration runs per target

use crate::migration::store::HistoryStore;
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

/// Advisory lock key shared by every process migrating the same database
pub const MIGRATION_LOCK_KEY: i64 = 0x5343_4847_5244; // "SCHGRD"

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock guard that releases the advisory lock when dropped
///
/// The lock is a PostgreSQL session lock, so it is also released if the
/// connection dies while it is held.
pub struct MigrationLockGuard<'a> {
    store: &'a dyn HistoryStore,
    key: i64,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, polling until `timeout` (default 60s).
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if another runner still holds
    /// the lock when the timeout expires.
    pub fn acquire(store: &'a dyn HistoryStore, timeout: Option<Duration>) -> Result<Self, MigrationError> {
        Self::acquire_key(store, MIGRATION_LOCK_KEY, timeout)
    }

    pub fn acquire_key(
        store: &'a dyn HistoryStore,
        key: i64,
        timeout: Option<Duration>,
    ) -> Result<Self, MigrationError> {
        let timeout = timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let start = Instant::now();
        loop {
            if store.try_lock(key)? {
                log::debug!("Acquired migration lock {}", key);
                return Ok(Self { store, key });
            }
            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout(format!(
                    "Failed to acquire migration lock within {} seconds. \
                     Another process may be running migrations against this database.",
                    timeout.as_secs()
                )));
            }
            may::coroutine::sleep(POLL_INTERVAL);
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(self.key) {
            log::warn!("Failed to release migration lock {}: {}", self.key, e);
        }
    }
}
