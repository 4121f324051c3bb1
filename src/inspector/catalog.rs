//! Catalog access: what [`capture`](super::capture) reads from a database

use super::{capture, ColumnInfo, FunctionInfo, IndexInfo, SchemaState, TableInfo};
use crate::executor::{column, DbError, SqlExecutor};
use crate::sql::{quote_ident, quote_literal};
use crate::transaction::{IsolationLevel, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;

pub trait Catalog {
    /// Base tables with their columns in ordinal order. Checksums are left
    /// empty; [`SchemaState::new`] fills them in.
    fn tables(&self) -> Result<Vec<TableInfo>, DbError>;

    fn indexes(&self) -> Result<Vec<IndexInfo>, DbError>;

    fn functions(&self) -> Result<Vec<FunctionInfo>, DbError>;

    fn row_count(&self, table: &str) -> Result<i64, DbError>;

    /// Every row of `table` as a self-contained `INSERT` statement.
    fn export_rows(&self, table: &str) -> Result<Vec<String>, DbError>;
}

/// [`Catalog`] over `pg_catalog` for one schema
pub struct PgCatalog<'a> {
    executor: &'a dyn SqlExecutor,
    schema: String,
}

impl<'a> PgCatalog<'a> {
    pub fn new(executor: &'a dyn SqlExecutor) -> Self {
        Self::with_schema(executor, "public")
    }

    pub fn with_schema(executor: &'a dyn SqlExecutor, schema: impl Into<String>) -> Self {
        Self {
            executor,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    /// `pg_get_functiondef` qualifies the function with its schema; strip
    /// it so the same function captured from different schemas compares
    /// equal.
    fn unqualify(&self, definition: String) -> String {
        let prefix = format!("FUNCTION {}.", self.schema);
        let quoted = format!("FUNCTION {}.", quote_ident(&self.schema));
        definition
            .replacen(&prefix, "FUNCTION ", 1)
            .replacen(&quoted, "FUNCTION ", 1)
    }
}

const COLUMNS_SQL: &str = r#"
SELECT c.relname::text,
       a.attname::text,
       format_type(a.atttypid, a.atttypmod)::text,
       NOT a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid)::text,
       EXISTS (
           SELECT 1 FROM pg_constraint p
           WHERE p.conrelid = c.oid AND p.contype = 'p' AND a.attnum = ANY (p.conkey)
       ),
       fk.ref_table,
       fk.ref_column
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
LEFT JOIN pg_attrdef d ON d.adrelid = c.oid AND d.adnum = a.attnum
LEFT JOIN LATERAL (
    SELECT r.relname::text AS ref_table, ra.attname::text AS ref_column
    FROM pg_constraint f
    CROSS JOIN LATERAL unnest(f.conkey, f.confkey) AS k(attnum, ref_attnum)
    JOIN pg_class r ON r.oid = f.confrelid
    JOIN pg_attribute ra ON ra.attrelid = f.confrelid AND ra.attnum = k.ref_attnum
    WHERE f.conrelid = c.oid AND f.contype = 'f' AND k.attnum = a.attnum
    ORDER BY f.conname
    LIMIT 1
) fk ON true
WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
ORDER BY c.relname, a.attnum
"#;

const INDEXES_SQL: &str = r#"
SELECT i.relname::text,
       t.relname::text,
       ix.indisunique,
       ix.indisprimary,
       ARRAY(
           SELECT pg_get_indexdef(ix.indexrelid, k.ord, true)
           FROM generate_series(1, ix.indnkeyatts::int) AS k(ord)
           ORDER BY k.ord
       )
FROM pg_index ix
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1
ORDER BY t.relname, i.relname
"#;

const FUNCTIONS_SQL: &str = r#"
SELECT p.proname::text,
       pg_get_function_identity_arguments(p.oid)::text,
       pg_get_functiondef(p.oid)::text
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname = $1 AND p.prokind = 'f'
ORDER BY p.proname, 2
"#;

impl Catalog for PgCatalog<'_> {
    fn tables(&self) -> Result<Vec<TableInfo>, DbError> {
        let rows = self.executor.query_all(COLUMNS_SQL, &[&self.schema])?;
        let mut tables: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
        for row in &rows {
            let table: String = column(row, 0)?;
            let references: Option<String> = column(row, 6)?;
            tables.entry(table).or_default().push(ColumnInfo {
                name: column(row, 1)?,
                data_type: column(row, 2)?,
                is_nullable: column(row, 3)?,
                default_value: column(row, 4)?,
                is_primary_key: column(row, 5)?,
                is_foreign_key: references.is_some(),
                references,
                references_column: column(row, 7)?,
            });
        }
        Ok(tables
            .into_iter()
            .map(|(name, columns)| TableInfo {
                name,
                columns,
                checksum: String::new(),
            })
            .collect())
    }

    fn indexes(&self) -> Result<Vec<IndexInfo>, DbError> {
        self.executor
            .query_all(INDEXES_SQL, &[&self.schema])?
            .iter()
            .map(|row| {
                Ok(IndexInfo {
                    name: column(row, 0)?,
                    table_name: column(row, 1)?,
                    is_unique: column(row, 2)?,
                    is_primary: column(row, 3)?,
                    columns: column(row, 4)?,
                })
            })
            .collect()
    }

    fn functions(&self) -> Result<Vec<FunctionInfo>, DbError> {
        self.executor
            .query_all(FUNCTIONS_SQL, &[&self.schema])?
            .iter()
            .map(|row| {
                Ok(FunctionInfo {
                    name: column(row, 0)?,
                    arguments: column(row, 1)?,
                    definition: self.unqualify(column(row, 2)?),
                    checksum: String::new(),
                })
            })
            .collect()
    }

    fn row_count(&self, table: &str) -> Result<i64, DbError> {
        let row = self
            .executor
            .query_one(&format!("SELECT count(*) FROM {}", self.qualified(table)), &[])?;
        column(&row, 0)
    }

    fn export_rows(&self, table: &str) -> Result<Vec<String>, DbError> {
        let sql = format!("SELECT row_to_json(t)::text FROM {} t", self.qualified(table));
        let target = quote_ident(table);
        self.executor
            .query_all(&sql, &[])?
            .iter()
            .map(|row| {
                let json: String = column(row, 0)?;
                Ok(format!(
                    "INSERT INTO {target} SELECT * FROM json_populate_record(NULL::{target}, {})",
                    quote_literal(&json)
                ))
            })
            .collect()
    }
}

/// Capture `schema` on a live connection inside a read-only snapshot,
/// cancelling the catalog queries after `timeout`.
pub fn capture_live(
    executor: &dyn SqlExecutor,
    schema: &str,
    timeout: Option<Duration>,
) -> Result<SchemaState, DbError> {
    let tx = Transaction::begin_with(executor, IsolationLevel::RepeatableRead, true)?;
    if let Some(timeout) = timeout {
        tx.set_statement_timeout(timeout)?;
    }
    let state = capture(&PgCatalog::with_schema(&tx, schema))?;
    tx.commit()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDb;

    impl SqlExecutor for NoDb {
        fn execute(&self, _: &str, _: &[&dyn may_postgres::types::ToSql]) -> Result<u64, DbError> {
            Err(DbError::Connection("offline".into()))
        }
        fn query_one(&self, _: &str, _: &[&dyn may_postgres::types::ToSql]) -> Result<may_postgres::Row, DbError> {
            Err(DbError::Connection("offline".into()))
        }
        fn query_all(&self, _: &str, _: &[&dyn may_postgres::types::ToSql]) -> Result<Vec<may_postgres::Row>, DbError> {
            Err(DbError::Connection("offline".into()))
        }
        fn batch_execute(&self, _: &str) -> Result<(), DbError> {
            Err(DbError::Connection("offline".into()))
        }
    }

    #[test]
    fn test_function_definitions_are_unqualified() {
        let catalog = PgCatalog::with_schema(&NoDb, "sg_shadow_1");
        let def = "CREATE OR REPLACE FUNCTION sg_shadow_1.touch()\n RETURNS integer".to_string();
        assert_eq!(
            catalog.unqualify(def),
            "CREATE OR REPLACE FUNCTION touch()\n RETURNS integer"
        );
    }

    #[test]
    fn test_qualified_table_names_are_quoted() {
        let catalog = PgCatalog::new(&NoDb);
        assert_eq!(catalog.qualified("Users"), "\"public\".\"Users\"");
        assert!(catalog.row_count("users").is_err());
    }
}
