//! Versioned schema migrations
//!
//! This module provides the migration engine, including:
//! - [`Migration`] and [`MigrationSet`], the one model both on-disk layouts load into
//! - [`MigrationRegistry`] for the `<semver>/metadata.json` layout
//! - [`Migrator`] for migrate, rollback, bootstrap, status and health checks
//! - [`HistoryStore`] bookkeeping in `schema_migrations_v2`
//! - [`MigrationLockGuard`] for per-target serialization
//!
//! # Example
//!
//! ```rust,no_run
//! use schemaguard::migration::{MigrateOptions, MigrationRegistry, Migrator, PgHistoryStore};
//! use schemaguard::{connect, MayPostgresExecutor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = MayPostgresExecutor::new(connect("postgresql://localhost/app")?);
//!     let store = PgHistoryStore::new(&executor);
//!
//!     let migrator = Migrator::from_registry(&MigrationRegistry::load("./migrations")?);
//!     let report = migrator.migrate(&store, &MigrateOptions::default())?;
//!     println!("{} migration(s) applied", report.changes());
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod compatibility;
pub mod error;
pub mod lock;
#[allow(clippy::module_inception)]
pub mod migration;
pub mod migrator;
pub mod record;
pub mod registry;
pub mod startup;
pub mod state_table;
pub mod status;
pub mod store;
pub mod version;

pub use checksum::{checksum, checksum_file, checksums_match};
pub use compatibility::{check_compatibility, CompatibilityLevel, CompatibilityMatrix, CompatibilityStatus};
pub use error::MigrationError;
pub use lock::{MigrationLockGuard, MIGRATION_LOCK_KEY};
pub use migration::{Migration, MigrationSet};
pub use migrator::{MigrateOptions, Migrator, RollbackOptions};
pub use record::{MigrationOutcome, MigrationRecord, MigrationReport, RecordStatus};
pub use registry::MigrationRegistry;
pub use startup::{startup_migrations, startup_migrations_from_registry, startup_migrations_with_timeout};
pub use state_table::{initialize_history_table, HISTORY_TABLE};
pub use status::{exit_code, HealthCheck, MigrationStatus, PendingMigration};
pub use store::{HistoryStore, PgHistoryStore, StepError};
pub use version::{parse_runtime_version, MigrationVersion, VersionParseError};
