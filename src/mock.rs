//! In-memory implementations of the storage traits, for tests and for
//! embedding the engine without a live database (`mock` feature).

use crate::agent::target::{SessionFn, TargetConnector, TargetSession};
use crate::agent::AgentError;
use crate::executor::DbError;
use crate::inspector::{capture, Catalog, FunctionInfo, IndexInfo, InspectorError, SchemaState, TableInfo};
use crate::manifest::SeedData;
use crate::metadb::{
    ApiKey, AuditEntry, Database, Deployment, DeploymentEntry, DeploymentMigration, DeploymentPage,
    DeploymentStatus, MetadataStore, NewDatabase, NewDeployment, DEFAULT_DATABASE_ENVIRONMENT,
};
use crate::migration::store::{HistoryStore, StepError};
use crate::migration::{Migration, MigrationError, MigrationRecord, MigrationSet, MigrationVersion, RecordStatus};
use crate::sql::split_statements;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct History {
    initialized: bool,
    records: BTreeMap<MigrationVersion, MigrationRecord>,
    locks: HashSet<i64>,
    executed: Vec<String>,
    fail_on: Option<String>,
}

/// [`HistoryStore`] that keeps records in memory and logs every executed
/// statement instead of running it
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<History>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, History> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make any statement containing `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        self.state().fail_on = Some(pattern.to_string());
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    pub fn is_locked(&self, key: i64) -> bool {
        self.state().locks.contains(&key)
    }

    /// Statements executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    pub fn applied_versions(&self) -> Vec<MigrationVersion> {
        self.state().records.keys().cloned().collect()
    }

    pub fn record(&self, version: &MigrationVersion) -> Option<MigrationRecord> {
        self.state().records.get(version).cloned()
    }

    /// Insert a history row directly, as if another runner had written it.
    pub fn insert_record(&self, record: MigrationRecord) {
        let mut state = self.state();
        state.initialized = true;
        state.records.insert(record.version.clone(), record);
    }

    fn run(&self, sql: &str) -> Result<(), StepError> {
        let mut state = self.state();
        if !state.initialized {
            return Err(StepError {
                statement: None,
                source: DbError::NotInitialized("relation \"schema_migrations_v2\" does not exist".into()),
            });
        }
        let statements = split_statements(sql);
        if let Some(pattern) = &state.fail_on {
            if let Some(bad) = statements.iter().find(|s| s.contains(pattern.as_str())) {
                return Err(StepError {
                    statement: Some(bad.clone()),
                    source: DbError::Other(format!("syntax error near \"{pattern}\"")),
                });
            }
        }
        state.executed.extend(statements);
        Ok(())
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn ensure_history_table(&self) -> Result<(), MigrationError> {
        self.state().initialized = true;
        Ok(())
    }

    fn applied_records(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        Ok(self.state().records.values().cloned().collect())
    }

    fn find_record(&self, version: &MigrationVersion) -> Result<Option<MigrationRecord>, MigrationError> {
        Ok(self.record(version))
    }

    fn apply(
        &self,
        migration: &Migration,
        runtime_version: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<MigrationRecord, StepError> {
        self.run(&migration.up_sql)?;
        let record = MigrationRecord {
            version: migration.version.clone(),
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_at: Utc::now(),
            runtime_version: runtime_version.map(str::to_string),
            execution_time_ms: 0,
            status: RecordStatus::Applied,
        };
        self.state().records.insert(record.version.clone(), record.clone());
        Ok(record)
    }

    fn revert(&self, migration: &Migration, _timeout: Option<Duration>) -> Result<u64, StepError> {
        self.run(migration.down_sql.as_deref().unwrap_or_default())?;
        self.state().records.remove(&migration.version);
        Ok(0)
    }

    fn try_lock(&self, key: i64) -> Result<bool, MigrationError> {
        Ok(self.state().locks.insert(key))
    }

    fn unlock(&self, key: i64) -> Result<(), MigrationError> {
        self.state().locks.remove(&key);
        Ok(())
    }
}

#[derive(Default)]
struct CatalogData {
    tables: Vec<TableInfo>,
    indexes: Vec<IndexInfo>,
    functions: Vec<FunctionInfo>,
    rows: BTreeMap<String, Vec<String>>,
}

/// [`Catalog`] over objects set by the test
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<CatalogData>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, CatalogData> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the schema objects with those of `state`.
    pub fn set_state(&self, state: &SchemaState) {
        let mut data = self.data();
        data.tables = state.tables.clone();
        data.indexes = state.indexes.clone();
        data.functions = state.functions.clone();
    }

    pub fn add_table(&self, table: TableInfo) {
        self.data().tables.push(table);
    }

    /// Set the rows of `table`, one `INSERT` statement per row.
    pub fn set_rows(&self, table: &str, rows: Vec<String>) {
        self.data().rows.insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<String> {
        self.data().rows.get(table).cloned().unwrap_or_default()
    }

    fn has_table(data: &CatalogData, table: &str) -> bool {
        data.tables.iter().any(|t| t.name == table) || data.rows.contains_key(table)
    }
}

impl Catalog for MemoryCatalog {
    fn tables(&self) -> Result<Vec<TableInfo>, DbError> {
        Ok(self.data().tables.clone())
    }

    fn indexes(&self) -> Result<Vec<IndexInfo>, DbError> {
        Ok(self.data().indexes.clone())
    }

    fn functions(&self) -> Result<Vec<FunctionInfo>, DbError> {
        Ok(self.data().functions.clone())
    }

    fn row_count(&self, table: &str) -> Result<i64, DbError> {
        let data = self.data();
        if !Self::has_table(&data, table) {
            return Err(DbError::NotInitialized(format!("relation \"{table}\" does not exist")));
        }
        Ok(data.rows.get(table).map_or(0, |rows| rows.len() as i64))
    }

    fn export_rows(&self, table: &str) -> Result<Vec<String>, DbError> {
        Ok(self.rows(table))
    }
}

/// One in-memory target database
#[derive(Default)]
pub struct MemoryTarget {
    pub history: MemoryHistoryStore,
    pub catalog: MemoryCatalog,
    expected: Mutex<Option<SchemaState>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema reported as the expected state of any manifest. Without one,
    /// the expected state is the live schema.
    pub fn set_expected(&self, state: SchemaState) {
        *self.expected.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state);
    }
}

impl TargetSession for MemoryTarget {
    fn history(&self) -> &dyn HistoryStore {
        &self.history
    }

    fn catalog(&self) -> &dyn Catalog {
        &self.catalog
    }

    fn capture(&self, _timeout: Option<Duration>) -> Result<SchemaState, DbError> {
        capture(&self.catalog)
    }

    fn expected_state(&self, _migrations: &MigrationSet, _timeout: Option<Duration>) -> Result<SchemaState, InspectorError> {
        let expected = self.expected.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        match expected {
            Some(state) => Ok(state),
            None => Ok(capture(&self.catalog)?),
        }
    }

    fn apply_seeds(&self, seeds: &[&SeedData]) -> Result<usize, DbError> {
        let mut executed = 0;
        for seed in seeds {
            let mut rows = self.catalog.rows(&seed.table_name);
            rows.extend(seed.statements.iter().cloned());
            executed += seed.statements.len();
            self.catalog.set_rows(&seed.table_name, rows);
        }
        Ok(executed)
    }
}

/// [`TargetConnector`] handing out [`MemoryTarget`]s by database name,
/// creating them on first use
#[derive(Default)]
pub struct MemoryTargets {
    targets: Mutex<HashMap<String, Arc<MemoryTarget>>>,
    unreachable: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    sessions: AtomicUsize,
}

impl MemoryTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self, database: &str) -> Arc<MemoryTarget> {
        let mut targets = self.targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(targets.entry(database.to_string()).or_default())
    }

    /// Make every session on `database` fail to connect.
    pub fn make_unreachable(&self, database: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(database.to_string());
    }

    /// Physical databases created so far
    pub fn created_databases(&self) -> Vec<String> {
        self.created.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl TargetConnector for MemoryTargets {
    fn with_session(&self, database: &Database, run: &mut SessionFn<'_>) -> Result<(), AgentError> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&database.name);
        if unreachable {
            return Err(AgentError::Database(DbError::Connection(format!(
                "could not connect to {}",
                database.name
            ))));
        }
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let target = self.target(&database.name);
        run(target.as_ref())
    }

    fn create_database(&self, _connection_string: &str, name: &str) -> Result<bool, AgentError> {
        let mut created = self.created.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if created.iter().any(|n| n == name) {
            return Ok(false);
        }
        created.push(name.to_string());
        Ok(true)
    }
}

#[derive(Default)]
struct Meta {
    databases: Vec<Database>,
    deployments: Vec<Deployment>,
    migrations: Vec<DeploymentMigration>,
    audit: Vec<AuditEntry>,
    keys: BTreeMap<String, ApiKey>,
    fail_audit: bool,
}

/// [`MetadataStore`] kept in memory
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<Meta>,
    calls: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the data, counting the access.
    fn meta(&self) -> MutexGuard<'_, Meta> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.peek()
    }

    fn peek(&self) -> MutexGuard<'_, Meta> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store operations other than audit writes performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_audit_writes(&self) {
        self.peek().fail_audit = true;
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.peek().audit.clone()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.peek().deployments.clone()
    }

    /// Register `key` and return it, for test setup.
    pub fn with_key(self, key: ApiKey) -> Self {
        self.peek().keys.insert(key.key_id.clone(), key);
        self
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn initialize(&self) -> Result<(), DbError> {
        self.meta();
        Ok(())
    }

    fn register_database(&self, database: &NewDatabase) -> Result<Database, DbError> {
        let mut meta = self.meta();
        if meta.databases.iter().any(|d| d.name == database.name) {
            return Err(DbError::Other(format!("database {} is already registered", database.name)));
        }
        let now = Utc::now();
        let registered = Database {
            id: Uuid::new_v4(),
            name: database.name.clone(),
            connection_string: database.connection_string.clone(),
            description: database.description.clone(),
            environment: database
                .environment
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_ENVIRONMENT.to_string()),
            is_active: true,
            tags: database.tags.clone(),
            created_by: database.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        meta.databases.push(registered.clone());
        Ok(registered)
    }

    fn find_database(&self, name: &str) -> Result<Option<Database>, DbError> {
        Ok(self.meta().databases.iter().find(|d| d.name == name).cloned())
    }

    fn list_databases(&self) -> Result<Vec<Database>, DbError> {
        let mut databases = self.meta().databases.clone();
        databases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(databases)
    }

    fn create_deployment(&self, deployment: &NewDeployment) -> Result<Deployment, DbError> {
        let created = Deployment {
            id: Uuid::new_v4(),
            database_id: deployment.database_id,
            version: deployment.version.clone(),
            manifest_version: deployment.manifest_version.clone(),
            status: DeploymentStatus::Pending,
            applied_at: None,
            applied_by: deployment.applied_by.clone(),
            checksum: deployment.checksum.clone(),
            execution_time_ms: 0,
            error_message: None,
            dry_run: deployment.dry_run,
            created_at: Utc::now(),
        };
        self.meta().deployments.push(created.clone());
        Ok(created)
    }

    fn finish_deployment(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        execution_time_ms: i64,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        let mut meta = self.meta();
        if let Some(deployment) = meta.deployments.iter_mut().find(|d| d.id == id) {
            deployment.status = status;
            deployment.execution_time_ms = execution_time_ms;
            deployment.error_message = error_message.map(str::to_string);
            deployment.applied_at = Some(Utc::now());
        }
        Ok(())
    }

    fn record_migration(&self, migration: &DeploymentMigration) -> Result<(), DbError> {
        self.meta().migrations.push(migration.clone());
        Ok(())
    }

    fn deployment_history(&self, database: &str, limit: i64, offset: i64) -> Result<DeploymentPage, DbError> {
        let meta = self.meta();
        let Some(db) = meta.databases.iter().find(|d| d.name == database) else {
            return Ok(DeploymentPage::default());
        };

        // Newest insert first, so equal timestamps keep that order.
        let mut deployments: Vec<&Deployment> =
            meta.deployments.iter().rev().filter(|d| d.database_id == db.id).collect();
        deployments.sort_by(|a, b| {
            let applied = match (a.applied_at, b.applied_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            applied.then(b.created_at.cmp(&a.created_at))
        });

        let total_count = deployments.len() as i64;
        let page: Vec<DeploymentEntry> = deployments
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|deployment| DeploymentEntry {
                deployment: deployment.clone(),
                migrations: meta
                    .migrations
                    .iter()
                    .filter(|m| m.deployment_id == deployment.id)
                    .cloned()
                    .collect(),
            })
            .collect();
        let has_more = offset.max(0) + (page.len() as i64) < total_count;

        Ok(DeploymentPage {
            deployments: page,
            total_count,
            has_more,
        })
    }

    fn log_audit(&self, entry: &AuditEntry) -> Result<(), DbError> {
        let mut meta = self.peek();
        if meta.fail_audit {
            return Err(DbError::Connection("audit log unavailable".into()));
        }
        meta.audit.push(entry.clone());
        Ok(())
    }

    fn register_api_key(&self, key: &ApiKey) -> Result<(), DbError> {
        self.peek().keys.insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    fn find_api_key(&self, key_id: &str) -> Result<Option<ApiKey>, DbError> {
        Ok(self.meta().keys.get(key_id).cloned())
    }

    fn touch_api_key(&self, key_id: &str) -> Result<(), DbError> {
        if let Some(key) = self.meta().keys.get_mut(key_id) {
            key.last_used_at = Some(Utc::now());
            key.usage_count += 1;
        }
        Ok(())
    }

    fn revoke_api_key(&self, key_id: &str) -> Result<bool, DbError> {
        Ok(match self.meta().keys.get_mut(key_id) {
            Some(key) => {
                key.is_active = false;
                true
            }
            None => false,
        })
    }

    fn list_api_keys(&self) -> Result<Vec<ApiKey>, DbError> {
        Ok(self.meta().keys.values().cloned().collect())
    }
}
