//! Connections to the registered target databases
//!
//! The service never opens target connections itself: it asks a
//! [`TargetConnector`] for a [`TargetSession`] on one database and does all
//! of its work through that session. [`PgTargets`] keeps one lazily created
//! pool per registered database; `crate::mock` provides an in-memory
//! connector for tests.

use crate::connection::{connect, database_name, validate_connection_string, with_database};
use crate::executor::{column, DbError, MayPostgresExecutor, SqlExecutor};
use crate::inspector::{capture_live, expected_state, Catalog, InspectorError, PgCatalog, SchemaState};
use crate::manifest::SeedData;
use crate::metadb::Database;
use crate::migration::{HistoryStore, MigrationSet, PgHistoryStore};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::sql::quote_ident;
use crate::transaction::Transaction;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::AgentError;

/// Database used for `CREATE DATABASE`
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Schema captured and compared on every target
pub const TARGET_SCHEMA: &str = "public";

/// One checked-out connection to a target database
///
/// Everything done through a session runs on the same connection, so a
/// migration lock taken through [`history`](TargetSession::history) holds
/// for the whole session.
pub trait TargetSession {
    fn history(&self) -> &dyn HistoryStore;

    fn catalog(&self) -> &dyn Catalog;

    /// Capture the live schema.
    fn capture(&self, timeout: Option<Duration>) -> Result<SchemaState, DbError>;

    /// Schema the migrations would produce, built without changing the target.
    fn expected_state(&self, migrations: &MigrationSet, timeout: Option<Duration>) -> Result<SchemaState, InspectorError>;

    /// Run the seed statements in one transaction. Returns the number of
    /// statements executed.
    fn apply_seeds(&self, seeds: &[&SeedData]) -> Result<usize, DbError>;
}

pub type SessionFn<'f> = dyn FnMut(&dyn TargetSession) -> Result<(), AgentError> + 'f;

pub trait TargetConnector: Send + Sync {
    /// Open a session on `database` and hand it to `run`. The connection is
    /// released when `run` returns, whatever the outcome.
    fn with_session(&self, database: &Database, run: &mut SessionFn<'_>) -> Result<(), AgentError>;

    /// Create the physical database `name` on the server `connection_string`
    /// points at. Returns `false` when it already exists.
    fn create_database(&self, connection_string: &str, name: &str) -> Result<bool, AgentError>;

    /// Forget any cached connections for `database`.
    fn evict(&self, _database: &str) {}
}

/// Run `f` in a session on `database` and return its result.
pub fn in_session<R>(
    targets: &dyn TargetConnector,
    database: &Database,
    f: impl FnOnce(&dyn TargetSession) -> Result<R, AgentError>,
) -> Result<R, AgentError> {
    let mut f = Some(f);
    let mut result = None;
    targets.with_session(database, &mut |session| {
        if let Some(f) = f.take() {
            result = Some(f(session)?);
        }
        Ok(())
    })?;
    result.ok_or_else(|| AgentError::Internal(format!("no session was opened on {}", database.name)))
}

/// Database named by `connection_string`, else `fallback`
pub fn physical_name(connection_string: &str, fallback: &str) -> String {
    database_name(connection_string).unwrap_or_else(|| fallback.to_string())
}

struct PgSession<'a> {
    executor: &'a dyn SqlExecutor,
    history: PgHistoryStore<'a>,
    catalog: PgCatalog<'a>,
}

impl<'a> PgSession<'a> {
    fn new(executor: &'a dyn SqlExecutor) -> Self {
        Self {
            executor,
            history: PgHistoryStore::new(executor),
            catalog: PgCatalog::with_schema(executor, TARGET_SCHEMA),
        }
    }
}

impl TargetSession for PgSession<'_> {
    fn history(&self) -> &dyn HistoryStore {
        &self.history
    }

    fn catalog(&self) -> &dyn Catalog {
        &self.catalog
    }

    fn capture(&self, timeout: Option<Duration>) -> Result<SchemaState, DbError> {
        capture_live(self.executor, TARGET_SCHEMA, timeout)
    }

    fn expected_state(&self, migrations: &MigrationSet, timeout: Option<Duration>) -> Result<SchemaState, InspectorError> {
        expected_state(self.executor, migrations, timeout)
    }

    fn apply_seeds(&self, seeds: &[&SeedData]) -> Result<usize, DbError> {
        let tx = Transaction::begin(self.executor)?;
        let mut executed = 0;
        for seed in seeds {
            log::debug!("Seeding {} ({} statements)", seed.table_name, seed.statements.len());
            for statement in &seed.statements {
                tx.batch_execute(statement)?;
                executed += 1;
            }
        }
        tx.commit()?;
        Ok(executed)
    }
}

/// Lazily created connection pools, one per registered database name
pub struct PgTargets {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl PgTargets {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_for(&self, database: &Database) -> Result<Arc<ConnectionPool>, AgentError> {
        let mut pools = self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pool) = pools.get(&database.name) {
            return Ok(Arc::clone(pool));
        }
        log::debug!("Creating connection pool for database {}", database.name);
        let pool = Arc::new(ConnectionPool::connect(&database.connection_string, self.settings)?);
        pools.insert(database.name.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn cached_pools(&self) -> usize {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl TargetConnector for PgTargets {
    fn with_session(&self, database: &Database, run: &mut SessionFn<'_>) -> Result<(), AgentError> {
        let pool = self.pool_for(database)?;
        let conn = pool.get()?;
        let executor: &MayPostgresExecutor = &conn;
        run(&PgSession::new(executor))
    }

    fn create_database(&self, connection_string: &str, name: &str) -> Result<bool, AgentError> {
        validate_connection_string(connection_string)?;
        let maintenance = MayPostgresExecutor::new(connect(&with_database(connection_string, MAINTENANCE_DATABASE))?);

        let exists: bool = column(
            &maintenance.query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&name],
            )?,
            0,
        )?;
        if exists {
            log::info!("Database {} already exists", name);
            return Ok(false);
        }

        maintenance.batch_execute(&format!("CREATE DATABASE {}", quote_ident(name)))?;
        log::info!("Created database {}", name);
        Ok(true)
    }

    fn evict(&self, database: &str) {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(database);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn database(url: &str) -> Database {
        Database {
            id: Uuid::new_v4(),
            name: "orders".into(),
            connection_string: url.into(),
            description: None,
            environment: "production".into(),
            is_active: true,
            tags: vec![],
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_invalid_connection_string_fails_before_pooling() {
        let targets = PgTargets::new(PoolSettings::default());
        let result = in_session(&targets, &database("nonsense"), |_| Ok(()));
        assert!(matches!(result, Err(AgentError::Connection(_))));
        assert_eq!(targets.cached_pools(), 0);
    }

    #[test]
    fn test_physical_name_prefers_connection_string() {
        assert_eq!(physical_name("postgres://u:p@h/billing", "orders"), "billing");
        assert_eq!(physical_name("postgres://u:p@h", "orders"), "orders");
    }
}
