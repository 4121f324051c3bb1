//! Expected schema state of a migration set

use super::{capture, InspectorError, PgCatalog, SchemaState};
use crate::executor::SqlExecutor;
use crate::migration::MigrationSet;
use crate::sql::{quote_ident, split_statements};
use crate::transaction::Transaction;
use std::time::Duration;

/// Replay every up migration of `migrations` in a throwaway schema and
/// capture the result.
///
/// Everything happens inside one transaction that is always rolled back,
/// so the target database is left exactly as it was.
pub fn expected_state(
    executor: &dyn SqlExecutor,
    migrations: &MigrationSet,
    timeout: Option<Duration>,
) -> Result<SchemaState, InspectorError> {
    let shadow = format!("sg_shadow_{}", uuid::Uuid::new_v4().simple());
    log::debug!("Replaying {} migrations in schema {}", migrations.len(), shadow);

    let tx = Transaction::begin(executor)?;
    if let Some(timeout) = timeout {
        tx.set_statement_timeout(timeout)?;
    }
    tx.batch_execute(&format!("CREATE SCHEMA {}", quote_ident(&shadow)))?;
    tx.batch_execute(&format!("SET LOCAL search_path TO {}", quote_ident(&shadow)))?;

    for migration in migrations.iter() {
        for statement in split_statements(&migration.up_sql) {
            tx.batch_execute(&statement).map_err(|source| InspectorError::Replay {
                version: migration.version.clone(),
                statement: Some(statement.clone()),
                source,
            })?;
        }
    }

    let state = capture(&PgCatalog::with_schema(&tx, shadow.as_str()))?;
    tx.rollback()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DbError;
    use crate::migration::{Migration, MigrationVersion};
    use may_postgres::types::ToSql;
    use may_postgres::Row;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl SqlExecutor for Recorder {
        fn execute(&self, _: &str, _: &[&dyn ToSql]) -> Result<u64, DbError> {
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
            match self.fail_on {
                Some(pattern) if sql.contains(pattern) => Err(DbError::Other("syntax error".into())),
                _ => Ok(()),
            }
        }
    }

    fn set() -> MigrationSet {
        [
            Migration::new(MigrationVersion::sequence(1), "create_users", "CREATE TABLE users (id INT);"),
            Migration::new(
                MigrationVersion::sequence(2),
                "add_email",
                "ALTER TABLE users ADD COLUMN email TEXT; CREATE INDEX idx_email ON users (email);",
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_replay_happens_in_a_rolled_back_shadow_schema() {
        let conn = Recorder::default();
        let state = expected_state(&conn, &set(), Some(Duration::from_secs(5))).unwrap();
        assert!(state.is_empty());

        let log = conn.log.borrow();
        assert!(log[0].starts_with("BEGIN"));
        assert!(log[1].starts_with("SET LOCAL statement_timeout"));
        assert!(log[2].starts_with("CREATE SCHEMA \"sg_shadow_"));
        assert!(log[3].starts_with("SET LOCAL search_path TO \"sg_shadow_"));
        assert_eq!(&log[4..7], &[
            "CREATE TABLE users (id INT)".to_string(),
            "ALTER TABLE users ADD COLUMN email TEXT".to_string(),
            "CREATE INDEX idx_email ON users (email)".to_string(),
        ]);
        assert_eq!(log.last().unwrap(), "ROLLBACK");
        assert!(!log.iter().any(|s| s == "COMMIT"));
    }

    #[test]
    fn test_replay_failure_names_the_statement() {
        let conn = Recorder {
            fail_on: Some("ADD COLUMN"),
            ..Recorder::default()
        };
        match expected_state(&conn, &set(), None) {
            Err(InspectorError::Replay { version, statement, .. }) => {
                assert_eq!(version, MigrationVersion::sequence(2));
                assert_eq!(statement.as_deref(), Some("ALTER TABLE users ADD COLUMN email TEXT"));
            }
            other => panic!("expected replay failure, got {other:?}"),
        }
        assert_eq!(conn.log.borrow().last().unwrap(), "ROLLBACK");
    }
}
