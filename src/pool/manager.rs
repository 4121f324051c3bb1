//! Bounded connection pool.
//!
//! Connections are opened lazily up to `max_connections` and parked in a
//! bounded crossbeam channel while idle. A [`PooledConnection`] hands its
//! connection back on drop, on success and error paths alike. Connections
//! that fail the pool's health check are closed instead of parked, and are
//! never handed out, so a pool recovers on its own after a server restart.

use crate::connection::{connect, validate_connection_string, ConnectionError};
use crate::executor::{DbError, MayPostgresExecutor};
use crate::pool::config::PoolSettings;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

type Factory<T> = Box<dyn Fn() -> Result<T, DbError> + Send + Sync>;
type HealthCheck<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Pool<T> {
    factory: Factory<T>,
    is_usable: HealthCheck<T>,
    settings: PoolSettings,
    idle_tx: Sender<T>,
    idle_rx: Receiver<T>,
    open: AtomicUsize,
}

/// Pool of `may_postgres` clients for one database URL
pub type ConnectionPool = Pool<MayPostgresExecutor>;

impl Pool<MayPostgresExecutor> {
    /// Create a pool for `url`. No connection is opened until the first `get`.
    pub fn connect(url: &str, settings: PoolSettings) -> Result<Self, ConnectionError> {
        validate_connection_string(url)?;
        let url = url.to_string();
        Ok(Self::with_factory(settings, move || {
            connect(&url)
                .map(MayPostgresExecutor::new)
                .map_err(|e| DbError::Connection(e.to_string()))
        })
        .with_health_check(|conn| !conn.is_broken()))
    }
}

impl<T> Pool<T> {
    pub fn with_factory<F>(settings: PoolSettings, factory: F) -> Self
    where
        F: Fn() -> Result<T, DbError> + Send + Sync + 'static,
    {
        let capacity = settings.max_connections.max(1);
        let (idle_tx, idle_rx) = bounded(capacity);
        Self {
            factory: Box::new(factory),
            is_usable: Box::new(|_| true),
            settings: PoolSettings {
                max_connections: capacity,
                ..settings
            },
            idle_tx,
            idle_rx,
            open: AtomicUsize::new(0),
        }
    }

    /// Only hand out (and park) connections for which `check` holds.
    pub fn with_health_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.is_usable = Box::new(check);
        self
    }

    /// Check out a connection, opening one if the pool is below capacity and
    /// otherwise waiting up to the acquire timeout for one to be returned.
    pub fn get(&self) -> Result<PooledConnection<'_, T>, DbError> {
        let deadline = Instant::now() + self.settings.acquire_timeout;
        loop {
            while let Ok(conn) = self.idle_rx.try_recv() {
                if let Some(conn) = self.checked(conn) {
                    return Ok(PooledConnection::new(self, conn));
                }
            }

            if let Some(opened) = self.open_new() {
                return opened.map(|conn| PooledConnection::new(self, conn));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.idle_rx.recv_timeout(remaining) {
                Ok(conn) => {
                    if let Some(conn) = self.checked(conn) {
                        return Ok(PooledConnection::new(self, conn));
                    }
                }
                Err(_) => {
                    return Err(DbError::Connection(format!(
                        "timed out after {:?} waiting for one of {} pooled connections",
                        self.settings.acquire_timeout, self.settings.max_connections
                    )))
                }
            }
        }
    }

    /// Pass `conn` through the health check, closing it if it fails.
    fn checked(&self, conn: T) -> Option<T> {
        if (self.is_usable)(&conn) {
            Some(conn)
        } else {
            log::debug!("Closing unusable pooled connection");
            self.forget();
            None
        }
    }

    /// Open a connection if a slot is free; `None` when at capacity.
    fn open_new(&self) -> Option<Result<T, DbError>> {
        loop {
            let open = self.open.load(Ordering::Acquire);
            if open >= self.settings.max_connections {
                return None;
            }
            if self
                .open
                .compare_exchange(open, open + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let opened = (self.factory)();
                if opened.is_err() {
                    self.forget();
                }
                return Some(opened);
            }
        }
    }

    /// Connections currently open, idle or checked out.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn idle_connections(&self) -> usize {
        self.idle_rx.len()
    }

    fn release(&self, conn: T) {
        if !(self.is_usable)(&conn) {
            log::debug!("Dropping pooled connection that failed while checked out");
            self.forget();
            return;
        }
        if self.idle_tx.try_send(conn).is_err() {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn forget(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checked-out connection; returns to its pool when dropped.
pub struct PooledConnection<'a, T> {
    pool: &'a Pool<T>,
    conn: Option<T>,
}

impl<'a, T> PooledConnection<'a, T> {
    fn new(pool: &'a Pool<T>, conn: T) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl<T> Deref for PooledConnection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<T> Drop for PooledConnection<'_, T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn counting_pool(max: usize) -> (Pool<u32>, Arc<AtomicU32>) {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::with_factory(
            PoolSettings {
                max_connections: max,
                acquire_timeout: Duration::from_millis(50),
            },
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
        );
        (pool, created)
    }

    #[test]
    fn test_connections_are_reused_after_drop() {
        let (pool, created) = counting_pool(2);
        {
            let conn = pool.get().unwrap();
            assert_eq!(*conn, 0);
        }
        let conn = pool.get().unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let (pool, _) = counting_pool(1);
        let _held = pool.get().unwrap();
        let err = pool.get().err().unwrap();
        assert!(matches!(err, DbError::Connection(_)));
    }

    /// Connection whose liveness the test controls
    struct FakeConn {
        id: u32,
        alive: Arc<AtomicBool>,
    }

    fn restartable_pool(max: usize) -> (Pool<FakeConn>, Arc<AtomicU32>, Arc<Mutex<Vec<Arc<AtomicBool>>>>) {
        let created = Arc::new(AtomicU32::new(0));
        let handles: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::default();
        let (counter, issued) = (Arc::clone(&created), Arc::clone(&handles));
        let pool = Pool::with_factory(
            PoolSettings {
                max_connections: max,
                acquire_timeout: Duration::from_millis(50),
            },
            move || {
                let alive = Arc::new(AtomicBool::new(true));
                issued.lock().unwrap().push(Arc::clone(&alive));
                Ok(FakeConn {
                    id: counter.fetch_add(1, Ordering::SeqCst),
                    alive,
                })
            },
        )
        .with_health_check(|conn: &FakeConn| conn.alive.load(Ordering::SeqCst));
        (pool, created, handles)
    }

    #[test]
    fn test_connection_failing_while_checked_out_is_replaced() {
        let (pool, created, _) = restartable_pool(1);
        {
            let conn = pool.get().unwrap();
            conn.alive.store(false, Ordering::SeqCst);
        }
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 0);

        let conn = pool.get().unwrap();
        assert_eq!(conn.id, 1);
        assert!(conn.alive.load(Ordering::SeqCst));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_idle_connections_dead_after_restart_are_skipped() {
        let (pool, created, handles) = restartable_pool(2);
        {
            let _a = pool.get().unwrap();
            let _b = pool.get().unwrap();
        }
        assert_eq!(pool.idle_connections(), 2);

        for alive in handles.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }

        let conn = pool.get().unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_factory_failure_does_not_leak_slots() {
        let pool: Pool<u32> = Pool::with_factory(PoolSettings::default(), || {
            Err(DbError::Connection("refused".into()))
        });
        assert!(pool.get().is_err());
        assert_eq!(pool.open_connections(), 0);
    }
}
