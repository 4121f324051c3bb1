//! SQL execution over `may_postgres`.
//!
//! [`SqlExecutor`] is the seam every PostgreSQL-backed component goes through:
//! the history store, the catalog reader, the metadata store and transactions.
//! Driver errors are classified into [`DbError`] once, here, so callers can
//! branch on "table not initialized" or "statement timed out" without looking
//! at error text.

use may_postgres::error::SqlState;
use may_postgres::types::{FromSql, ToSql};
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Storage-layer error
#[derive(Debug)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres` that has no more specific class
    Postgres(PostgresError),
    /// A relation the caller relies on does not exist yet (SQLSTATE 42P01)
    NotInitialized(String),
    /// The statement was cancelled by `statement_timeout` (SQLSTATE 57014)
    Timeout(String),
    /// Could not establish or obtain a connection
    Connection(String),
    /// Row decoding/conversion error
    Parse(String),
    /// Other execution errors
    Other(String),
}

impl DbError {
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, DbError::NotInitialized(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DbError::Timeout(_))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            DbError::NotInitialized(s) => write!(f, "Not initialized: {s}"),
            DbError::Timeout(s) => write!(f, "Statement timed out: {s}"),
            DbError::Connection(s) => write!(f, "Connection error: {s}"),
            DbError::Parse(s) => write!(f, "Parse error: {s}"),
            DbError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Postgres(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PostgresError> for DbError {
    fn from(err: PostgresError) -> Self {
        classify(err)
    }
}

/// Map a driver error onto [`DbError`] by SQLSTATE.
pub fn classify(err: PostgresError) -> DbError {
    match err.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE => DbError::NotInitialized(err.to_string()),
        Some(code) if *code == SqlState::QUERY_CANCELED => DbError::Timeout(err.to_string()),
        _ => DbError::Postgres(err),
    }
}

/// Errors the server answered carry a SQLSTATE; the rest come from the
/// session (I/O, closed connection) or from the client side. Treating the
/// latter as lost too only costs a reconnect.
fn session_lost(err: &PostgresError) -> bool {
    err.code().is_none()
}

/// Decode column `idx` of `row`, reporting failures as [`DbError::Parse`].
pub fn column<'a, T>(row: &'a Row, idx: usize) -> Result<T, DbError>
where
    T: FromSql<'a>,
{
    row.try_get::<_, T>(idx)
        .map_err(|e| DbError::Parse(format!("column {idx}: {e}")))
}

/// Trait for executing database operations
///
/// Implemented by [`MayPostgresExecutor`] (a dedicated client) and by
/// [`Transaction`](crate::transaction::Transaction), so code written against
/// `&dyn SqlExecutor` runs the same inside or outside a transaction.
pub trait SqlExecutor {
    /// Execute a statement and return the number of rows affected.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError>;

    /// Execute a query that must return exactly one row.
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError>;

    /// Execute a query and return all rows.
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError>;

    /// Run raw SQL through the simple query protocol, without parameters.
    ///
    /// Used for DDL, transaction control and migration bodies.
    fn batch_execute(&self, sql: &str) -> Result<(), DbError>;
}

/// Implementation of `SqlExecutor` for `may_postgres::Client`
pub struct MayPostgresExecutor {
    client: Client,
    broken: AtomicBool,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            broken: AtomicBool::new(false),
        }
    }

    /// A driver error without a SQLSTATE was seen: the session itself
    /// failed (closed socket, server restart) rather than a statement.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Check if the underlying connection is healthy (`SELECT 1` round trip)
    pub fn check_health(&self) -> Result<bool, DbError> {
        crate::connection::check_connection_health(&self.client)
            .map_err(|e| DbError::Connection(format!("Health check error: {e}")))
    }

    fn observe<T>(&self, query: &str, run: impl FnOnce() -> Result<T, PostgresError>) -> Result<T, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("sql", statement = %crate::sql::preview(query, 80)).entered();
        #[cfg(not(feature = "tracing"))]
        let _ = query;

        let start = Instant::now();
        let result = run().map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            if session_lost(&e) {
                log::warn!("Connection lost: {}", e);
                self.broken.store(true, Ordering::Release);
            }
            classify(e)
        });

        #[cfg(feature = "metrics")]
        METRICS.record_query(start.elapsed());
        #[cfg(not(feature = "metrics"))]
        let _ = start;

        result
    }
}

impl SqlExecutor for MayPostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.observe(query, || self.client.execute(query, params))
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.observe(query, || self.client.query_one(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.observe(query, || self.client.query(query, params))
    }

    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.observe(sql, || self.client.batch_execute(sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_display() {
        let err = DbError::Other("test error".to_string());
        assert!(err.to_string().contains("Execution error"));

        let err = DbError::Parse("bad column".to_string());
        assert!(err.to_string().contains("Parse error"));
    }

    #[test]
    fn test_classification_helpers() {
        assert!(DbError::NotInitialized("relation \"x\" does not exist".into()).is_not_initialized());
        assert!(DbError::Timeout("canceling statement".into()).is_timeout());
        assert!(!DbError::Other("boom".into()).is_timeout());
        assert!(!DbError::Connection("refused".into()).is_not_initialized());
    }
}
