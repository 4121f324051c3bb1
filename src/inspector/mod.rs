//! Schema-state inspection
//!
//! [`capture`] reads tables, indexes and functions through a [`Catalog`] and
//! reduces every object, and then the whole schema, to a SHA-256 checksum.
//! Two captures of an unchanged schema always produce the same top-level
//! checksum, so equality is a single string comparison; [`compare`] only
//! walks the objects when the checksums differ.
//!
//! Capturing is read-only.

pub mod catalog;
pub mod compare;
pub mod reverse;
pub mod shadow;

pub use catalog::{capture_live, Catalog, PgCatalog};
pub use compare::{compare, Drift, DriftChange, ObjectKind, SchemaComparison};
pub use reverse::{creation_order, export_seed_data, reverse_engineer};
pub use shadow::expected_state;

use crate::executor::DbError;
use crate::migration::{checksum, MigrationVersion};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tables owned by the engine itself; never part of a captured schema
pub const IGNORED_TABLES: &[&str] = &[crate::migration::HISTORY_TABLE];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    /// Table referenced by this column's foreign key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    /// Column of `references` the key points at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    /// In catalog (ordinal) order
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub checksum: String,
}

impl TableInfo {
    /// Tables this one references through foreign keys, excluding itself.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .columns
            .iter()
            .filter_map(|c| c.references.as_deref())
            .filter(|r| *r != self.name)
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table_name: String,
    /// Key columns in index order; expression keys hold the expression text
    pub columns: Vec<String>,
    pub is_unique: bool,
    /// Backs the table's primary key
    #[serde(default)]
    pub is_primary: bool,
}

impl IndexInfo {
    /// `table.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.table_name, self.name)
    }

    /// `table.name:unique:col1,col2`
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}",
            self.qualified_name(),
            self.is_unique,
            self.columns.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    /// Identity argument list, e.g. `a integer, b text`; tells overloads apart
    #[serde(default)]
    pub arguments: String,
    /// Full `CREATE OR REPLACE FUNCTION` text
    pub definition: String,
    #[serde(default)]
    pub checksum: String,
}

impl FunctionInfo {
    /// `name(arguments)`, unique within a schema
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.arguments)
    }
}

/// Snapshot of one schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaState {
    pub tables: Vec<TableInfo>,
    pub indexes: Vec<IndexInfo>,
    pub functions: Vec<FunctionInfo>,
    pub checksum: String,
}

impl SchemaState {
    /// Build a state from raw catalog objects, sorting them and filling in
    /// every checksum.
    pub fn new(mut tables: Vec<TableInfo>, mut indexes: Vec<IndexInfo>, mut functions: Vec<FunctionInfo>) -> Self {
        tables.retain(|t| !IGNORED_TABLES.contains(&t.name.as_str()));
        indexes.retain(|i| !IGNORED_TABLES.contains(&i.table_name.as_str()));
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        indexes.sort_by_key(|i| i.qualified_name());
        functions.sort_by_key(FunctionInfo::signature);

        for table in &mut tables {
            table.checksum = table_checksum(table);
        }
        for function in &mut functions {
            function.checksum = function_checksum(function);
        }

        let mut state = Self {
            tables,
            indexes,
            functions,
            checksum: String::new(),
        };
        state.checksum = schema_checksum(&state);
        state
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn indexes_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexInfo> + 'a {
        self.indexes.iter().filter(move |i| i.table_name == table)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.indexes.is_empty() && self.functions.is_empty()
    }
}

/// SHA-256 over `name|col:type:nullable:default:pk:fk|...`, columns sorted by name.
pub fn table_checksum(table: &TableInfo) -> String {
    let mut columns: Vec<&ColumnInfo> = table.columns.iter().collect();
    columns.sort_by(|a, b| a.name.cmp(&b.name));

    let mut parts = Vec::with_capacity(columns.len() + 1);
    parts.push(table.name.clone());
    for col in columns {
        parts.push(format!(
            "{}:{}:{}:{}:{}:{}",
            col.name,
            col.data_type,
            col.is_nullable,
            col.default_value.as_deref().unwrap_or_default(),
            col.is_primary_key,
            col.is_foreign_key
        ));
    }
    checksum(parts.join("|"))
}

pub fn function_checksum(function: &FunctionInfo) -> String {
    checksum(format!("{}:{}", function.signature(), function.definition))
}

/// SHA-256 over the sorted `table:`, `index:` and `function:` lines.
pub fn schema_checksum(state: &SchemaState) -> String {
    let mut parts: Vec<String> = state
        .tables
        .iter()
        .map(|t| format!("table:{}:{}", t.name, t.checksum))
        .chain(state.indexes.iter().map(|i| format!("index:{}:{}", i.name, i.signature())))
        .chain(state.functions.iter().map(|f| format!("function:{}:{}", f.signature(), f.checksum)))
        .collect();
    parts.sort();
    checksum(parts.join("|"))
}

/// Capture the schema visible through `catalog`.
pub fn capture(catalog: &dyn Catalog) -> Result<SchemaState, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!("schema.capture").entered();

    let tables = catalog.tables()?;
    let indexes = catalog.indexes()?;
    let functions = catalog.functions()?;
    let state = SchemaState::new(tables, indexes, functions);
    log::debug!(
        "Captured {} tables, {} indexes, {} functions (checksum {})",
        state.tables.len(),
        state.indexes.len(),
        state.functions.len(),
        state.checksum
    );
    Ok(state)
}

#[derive(Debug)]
pub enum InspectorError {
    Database(DbError),
    /// A manifest migration failed while building the expected schema
    Replay {
        version: MigrationVersion,
        statement: Option<String>,
        source: DbError,
    },
    /// Foreign keys form a cycle, so no creation order exists
    DependencyCycle(Vec<String>),
}

impl fmt::Display for InspectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectorError::Database(e) => write!(f, "Schema inspection failed: {}", e),
            InspectorError::Replay {
                version,
                statement,
                source,
            } => {
                write!(f, "Replaying migration {} failed: {}", version, source)?;
                if let Some(statement) = statement {
                    write!(f, "\nFailing statement: {}", statement)?;
                }
                Ok(())
            }
            InspectorError::DependencyCycle(tables) => {
                write!(f, "Foreign keys form a cycle between tables: {}", tables.join(", "))
            }
        }
    }
}

impl std::error::Error for InspectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InspectorError::Database(e) | InspectorError::Replay { source: e, .. } => Some(e),
            InspectorError::DependencyCycle(_) => None,
        }
    }
}

impl From<DbError> for InspectorError {
    fn from(error: DbError) -> Self {
        InspectorError::Database(error)
    }
}
