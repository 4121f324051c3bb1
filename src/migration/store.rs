//! History bookkeeping behind the migrator.
//!
//! [`HistoryStore`] is everything the engine needs from a target database:
//! the history table, atomic apply-and-record, atomic revert-and-delete and
//! a per-target advisory lock. [`PgHistoryStore`] implements it over any
//! [`SqlExecutor`]; tests use the in-memory store from `crate::mock`.

use crate::executor::{DbError, SqlExecutor};
use crate::migration::state_table::{initialize_history_table, HISTORY_TABLE};
use crate::migration::{Migration, MigrationError, MigrationRecord, MigrationVersion, RecordStatus};
use crate::sql::split_statements;
use crate::transaction::Transaction;
use chrono::Utc;
use std::fmt;
use std::time::{Duration, Instant};

/// A failed apply or revert step
///
/// `statement` is the statement that failed, or `None` when the failure was
/// in transaction control or the history write itself.
#[derive(Debug)]
pub struct StepError {
    pub statement: Option<String>,
    pub source: DbError,
}

impl StepError {
    fn bookkeeping(source: DbError) -> Self {
        Self { statement: None, source }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.statement {
            Some(statement) => write!(f, "{} (statement: {})", self.source, statement),
            None => write!(f, "{}", self.source),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub trait HistoryStore {
    /// Create the history table if it does not exist.
    fn ensure_history_table(&self) -> Result<(), MigrationError>;

    /// All `applied` records, ascending by version. A target that was never
    /// initialized has no records.
    fn applied_records(&self) -> Result<Vec<MigrationRecord>, MigrationError>;

    fn find_record(&self, version: &MigrationVersion) -> Result<Option<MigrationRecord>, MigrationError>;

    /// Run `migration`'s up SQL and write its history row in one
    /// transaction. Nothing is committed if any statement fails.
    fn apply(
        &self,
        migration: &Migration,
        runtime_version: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<MigrationRecord, StepError>;

    /// Run `migration`'s down SQL and delete its history row in one
    /// transaction.
    fn revert(&self, migration: &Migration, timeout: Option<Duration>) -> Result<u64, StepError>;

    /// Try to take the session advisory lock `key` without waiting.
    fn try_lock(&self, key: i64) -> Result<bool, MigrationError>;

    fn unlock(&self, key: i64) -> Result<(), MigrationError>;
}

/// [`HistoryStore`] over a live PostgreSQL session
///
/// The advisory lock is session-scoped, so the store must be used with the
/// same connection for the whole run.
pub struct PgHistoryStore<'a> {
    executor: &'a dyn SqlExecutor,
}

impl<'a> PgHistoryStore<'a> {
    pub fn new(executor: &'a dyn SqlExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &'a dyn SqlExecutor {
        self.executor
    }

    fn select_records(&self, filter: &str, params: &[&dyn may_postgres::types::ToSql]) -> Result<Vec<MigrationRecord>, DbError> {
        let sql = format!(
            "SELECT version, name, checksum, applied_at, runtime_version, execution_time_ms, status \
             FROM {HISTORY_TABLE} WHERE {filter}"
        );
        self.executor
            .query_all(&sql, params)?
            .iter()
            .map(MigrationRecord::from_row)
            .collect()
    }

    /// Run each statement of `sql` in `tx`, reporting the one that fails.
    fn run_statements(tx: &Transaction<'_>, sql: &str) -> Result<(), StepError> {
        for statement in split_statements(sql) {
            log::debug!("Executing: {}", crate::sql::preview(&statement, 120));
            if let Err(source) = tx.batch_execute(&statement) {
                return Err(StepError {
                    statement: Some(statement),
                    source,
                });
            }
        }
        Ok(())
    }
}

impl HistoryStore for PgHistoryStore<'_> {
    fn ensure_history_table(&self) -> Result<(), MigrationError> {
        initialize_history_table(self.executor).map_err(MigrationError::database("create history table"))
    }

    fn applied_records(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        match self.select_records("status = 'applied'", &[]) {
            Ok(mut records) => {
                records.sort_by(|a, b| a.version.cmp(&b.version));
                Ok(records)
            }
            Err(e) if e.is_not_initialized() => Ok(Vec::new()),
            Err(e) => Err(MigrationError::database("read migration history")(e)),
        }
    }

    fn find_record(&self, version: &MigrationVersion) -> Result<Option<MigrationRecord>, MigrationError> {
        let version = version.to_string();
        match self.select_records("version = $1", &[&version]) {
            Ok(records) => Ok(records.into_iter().next()),
            Err(e) if e.is_not_initialized() => Ok(None),
            Err(e) => Err(MigrationError::database("read migration record")(e)),
        }
    }

    fn apply(
        &self,
        migration: &Migration,
        runtime_version: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<MigrationRecord, StepError> {
        let tx = Transaction::begin(self.executor).map_err(StepError::bookkeeping)?;
        if let Some(timeout) = timeout {
            tx.set_statement_timeout(timeout).map_err(StepError::bookkeeping)?;
        }

        let start = Instant::now();
        Self::run_statements(&tx, &migration.up_sql)?;
        let execution_time_ms = start.elapsed().as_millis() as i64;

        let record = MigrationRecord {
            version: migration.version.clone(),
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_at: Utc::now(),
            runtime_version: runtime_version.map(str::to_string),
            execution_time_ms,
            status: RecordStatus::Applied,
        };
        let version = record.version.to_string();
        let sql = format!(
            "INSERT INTO {HISTORY_TABLE} \
             (version, name, checksum, applied_at, runtime_version, execution_time_ms, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'applied') \
             ON CONFLICT (version) DO UPDATE SET \
             name = EXCLUDED.name, checksum = EXCLUDED.checksum, applied_at = EXCLUDED.applied_at, \
             runtime_version = EXCLUDED.runtime_version, \
             execution_time_ms = EXCLUDED.execution_time_ms, status = 'applied'"
        );
        tx.execute(
            &sql,
            &[
                &version,
                &record.name,
                &record.checksum,
                &record.applied_at,
                &record.runtime_version,
                &record.execution_time_ms,
            ],
        )
        .map_err(StepError::bookkeeping)?;
        tx.commit().map_err(StepError::bookkeeping)?;
        Ok(record)
    }

    fn revert(&self, migration: &Migration, timeout: Option<Duration>) -> Result<u64, StepError> {
        let down_sql = migration.down_sql.as_deref().unwrap_or_default();
        let tx = Transaction::begin(self.executor).map_err(StepError::bookkeeping)?;
        if let Some(timeout) = timeout {
            tx.set_statement_timeout(timeout).map_err(StepError::bookkeeping)?;
        }

        let start = Instant::now();
        Self::run_statements(&tx, down_sql)?;
        let version = migration.version.to_string();
        tx.execute(
            &format!("DELETE FROM {HISTORY_TABLE} WHERE version = $1"),
            &[&version],
        )
        .map_err(StepError::bookkeeping)?;
        tx.commit().map_err(StepError::bookkeeping)?;
        Ok(start.elapsed().as_millis() as u64)
    }

    fn try_lock(&self, key: i64) -> Result<bool, MigrationError> {
        let row = self
            .executor
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .map_err(MigrationError::database("acquire migration lock"))?;
        crate::executor::column(&row, 0).map_err(MigrationError::database("acquire migration lock"))
    }

    fn unlock(&self, key: i64) -> Result<(), MigrationError> {
        self.executor
            .query_one("SELECT pg_advisory_unlock($1)", &[&key])
            .map(|_| ())
            .map_err(MigrationError::database("release migration lock"))
    }
}
