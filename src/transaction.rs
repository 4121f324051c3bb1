//! Transactions over any [`SqlExecutor`].
//!
//! A [`Transaction`] borrows the connection it was started on and issues
//! `BEGIN`/`COMMIT`/`ROLLBACK` through it. Dropping an unfinished transaction
//! rolls it back, so an early return or `?` never leaves the session inside
//! an open transaction.

use crate::executor::{DbError, SqlExecutor};
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::cell::Cell;
use std::time::Duration;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// An open transaction on a borrowed connection
pub struct Transaction<'a> {
    conn: &'a dyn SqlExecutor,
    finished: Cell<bool>,
}

impl<'a> Transaction<'a> {
    /// Start a read-write transaction at the default isolation level.
    pub fn begin(conn: &'a dyn SqlExecutor) -> Result<Self, DbError> {
        Self::begin_with(conn, IsolationLevel::default(), false)
    }

    /// Start a transaction with an explicit isolation level and access mode.
    pub fn begin_with(
        conn: &'a dyn SqlExecutor,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> Result<Self, DbError> {
        let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
        conn.batch_execute(&format!(
            "BEGIN ISOLATION LEVEL {} {}",
            isolation.to_sql(),
            mode
        ))?;
        Ok(Self {
            conn,
            finished: Cell::new(false),
        })
    }

    /// Bound every following statement of this transaction by `timeout`.
    ///
    /// Uses `SET LOCAL`, so the setting disappears with the transaction.
    pub fn set_statement_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.conn.batch_execute(&format!(
            "SET LOCAL statement_timeout = '{}ms'",
            timeout.as_millis().max(1)
        ))
    }

    pub fn commit(self) -> Result<(), DbError> {
        self.finished.set(true);
        self.conn.batch_execute("COMMIT")
    }

    pub fn rollback(self) -> Result<(), DbError> {
        self.finished.set(true);
        self.conn.batch_execute("ROLLBACK")
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            if let Err(e) = self.conn.batch_execute("ROLLBACK") {
                log::warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}

impl SqlExecutor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.conn.execute(query, params)
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.conn.query_one(query, params)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.conn.query_all(query, params)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.conn.batch_execute(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records raw SQL instead of talking to a server.
    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<String>>,
    }

    impl SqlExecutor for Recorder {
        fn execute(&self, query: &str, _: &[&dyn ToSql]) -> Result<u64, DbError> {
            self.log.borrow_mut().push(query.to_string());
            Ok(0)
        }

        fn query_one(&self, _: &str, _: &[&dyn ToSql]) -> Result<Row, DbError> {
            Err(DbError::Other("no rows in recorder".into()))
        }

        fn query_all(&self, _: &str, _: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }

        fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
            self.log.borrow_mut().push(sql.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_commit_issues_begin_and_commit() {
        let conn = Recorder::default();
        let tx = Transaction::begin(&conn).unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        tx.commit().unwrap();

        let log = conn.log.borrow();
        assert_eq!(log[0], "BEGIN ISOLATION LEVEL READ COMMITTED READ WRITE");
        assert_eq!(log.last().unwrap(), "COMMIT");
        assert!(!log.iter().any(|s| s == "ROLLBACK"));
    }

    #[test]
    fn test_drop_rolls_back_unfinished_transaction() {
        let conn = Recorder::default();
        {
            let tx = Transaction::begin_with(&conn, IsolationLevel::RepeatableRead, true).unwrap();
            tx.set_statement_timeout(Duration::from_secs(2)).unwrap();
        }

        let log = conn.log.borrow();
        assert_eq!(log[0], "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY");
        assert_eq!(log[1], "SET LOCAL statement_timeout = '2000ms'");
        assert_eq!(log.last().unwrap(), "ROLLBACK");
    }
}
