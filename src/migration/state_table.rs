//! Migration history table management

use crate::executor::{DbError, SqlExecutor};
use sea_query::{ColumnDef, Expr, Index, IndexCreateStatement, PostgresQueryBuilder, Table, TableCreateStatement};

pub const HISTORY_TABLE: &str = "schema_migrations_v2";

/// `schema_migrations_v2`: one row per applied migration
///
/// - `version` (semver or `V<seq>` text, primary key)
/// - `name`
/// - `checksum` (SHA-256 of the up SQL)
/// - `applied_at`
/// - `runtime_version` (runtime that applied it, if known)
/// - `execution_time_ms`
/// - `status`
pub fn create_history_table() -> TableCreateStatement {
    Table::create()
        .table(HISTORY_TABLE)
        .if_not_exists()
        .col(ColumnDef::new("version").string_len(64).not_null().primary_key())
        .col(ColumnDef::new("name").string_len(255).not_null())
        .col(ColumnDef::new("checksum").string_len(64).not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(ColumnDef::new("runtime_version").string_len(64).null())
        .col(ColumnDef::new("execution_time_ms").big_integer().null())
        .col(ColumnDef::new("status").string_len(32).not_null().default("applied"))
        .to_owned()
}

/// Index on `applied_at` for history listings
pub fn create_history_table_index() -> IndexCreateStatement {
    Index::create()
        .if_not_exists()
        .name("idx_schema_migrations_v2_applied_at")
        .table(HISTORY_TABLE)
        .col("applied_at")
        .to_owned()
}

/// Create the history table and its index if they don't exist.
pub fn initialize_history_table(executor: &dyn SqlExecutor) -> Result<(), DbError> {
    executor.batch_execute(&create_history_table().build(PostgresQueryBuilder))?;
    executor.batch_execute(&create_history_table_index().build(PostgresQueryBuilder))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_table_ddl() {
        let sql = create_history_table().build(PostgresQueryBuilder);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"schema_migrations_v2\""));
        assert!(sql.contains("\"version\" varchar(64) NOT NULL PRIMARY KEY"));
        assert!(sql.contains("\"execution_time_ms\" bigint"));
        assert!(sql.contains("'applied'"));
    }

    #[test]
    fn test_history_index_ddl() {
        let sql = create_history_table_index().build(PostgresQueryBuilder);
        assert!(sql.contains("IF NOT EXISTS"));
        assert!(sql.contains("\"applied_at\""));
    }
}
