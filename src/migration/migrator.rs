//! Migrator - core migration execution engine

use crate::migration::compatibility::{check_compatibility, CompatibilityLevel, CompatibilityMatrix};
use crate::migration::registry::{self, MigrationRegistry};
use crate::migration::status::{exit_code, HealthCheck};
use crate::migration::store::HistoryStore;
use crate::migration::{
    checksums_match, Migration, MigrationError, MigrationOutcome, MigrationRecord, MigrationReport,
    MigrationSet, MigrationStatus, MigrationVersion, PendingMigration, RecordStatus,
};
use std::collections::BTreeSet;
use std::time::Duration;

/// Options for [`Migrator::migrate`]
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Validate and plan without touching the target
    pub dry_run: bool,
    /// Stop after this version (inclusive)
    pub max_version: Option<MigrationVersion>,
    /// Runtime to check compatibility bounds against; no check when unset
    pub runtime_version: Option<semver::Version>,
    /// Abort on an incompatible runtime instead of logging a warning
    pub fail_on_incompatible: bool,
    /// Per-statement deadline inside each migration transaction
    pub statement_timeout: Option<Duration>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_version: None,
            runtime_version: None,
            fail_on_incompatible: true,
            statement_timeout: None,
        }
    }
}

/// Options for [`Migrator::rollback`]
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub dry_run: bool,
    pub statement_timeout: Option<Duration>,
}

/// Core migration execution engine
///
/// The `Migrator` owns the available migrations and drives a target through
/// a [`HistoryStore`]. Each migration is applied (or reverted) in its own
/// transaction, so a failed run keeps everything committed before the
/// failing step and can simply be re-run.
pub struct Migrator {
    migrations: MigrationSet,
}

impl Migrator {
    pub fn new(migrations: MigrationSet) -> Self {
        Self { migrations }
    }

    pub fn from_registry(registry: &MigrationRegistry) -> Self {
        Self::new(registry.migrations().clone())
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Get migration status (applied vs pending)
    ///
    /// Never writes to the target. Fails with `ChecksumMismatch` if an
    /// applied migration was edited after it was applied.
    pub fn status(&self, store: &dyn HistoryStore) -> Result<MigrationStatus, MigrationError> {
        let applied = store.applied_records()?;
        let unknown = self.verify_applied(&applied)?;
        let applied_versions: BTreeSet<&MigrationVersion> = applied.iter().map(|r| &r.version).collect();
        let pending = self
            .migrations
            .iter()
            .filter(|m| !applied_versions.contains(&m.version))
            .map(PendingMigration::from)
            .collect();

        Ok(MigrationStatus {
            applied,
            pending,
            unknown,
        })
    }

    /// Check every applied migration against its current checksum.
    pub fn validate_checksums(&self, store: &dyn HistoryStore) -> Result<(), MigrationError> {
        self.status(store).map(|_| ())
    }

    /// Apply pending migrations in ascending version order.
    pub fn migrate(&self, store: &dyn HistoryStore, options: &MigrateOptions) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::new(options.dry_run);
        self.migrate_into(store, options, &mut report)?;
        Ok(report)
    }

    /// Like [`migrate`](Self::migrate), but outcomes are recorded in a
    /// caller-owned report that stays available when the run aborts.
    pub fn migrate_into(
        &self,
        store: &dyn HistoryStore,
        options: &MigrateOptions,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        if !options.dry_run {
            store.ensure_history_table()?;
        }

        let applied = store.applied_records()?;
        for version in self.verify_applied(&applied)? {
            report.warn(format!("Applied migration {version} is not in the migration set"));
        }

        let runtime_label = options.runtime_version.as_ref().map(|v| v.to_string());
        let mut satisfied: BTreeSet<MigrationVersion> = applied.into_iter().map(|r| r.version).collect();

        for migration in self.migrations.iter() {
            if satisfied.contains(&migration.version) {
                continue;
            }
            if let Some(max) = &options.max_version {
                if migration.version > *max {
                    log::debug!("Stopping before {} (max version {})", migration.version, max);
                    break;
                }
            }

            registry::validate_dependencies(migration, &satisfied)?;

            if let Some(runtime) = &options.runtime_version {
                let compat = check_compatibility(migration, runtime);
                match compat.status {
                    CompatibilityLevel::Incompatible if options.fail_on_incompatible => {
                        return Err(MigrationError::IncompatibleRuntime {
                            version: migration.version.clone(),
                            runtime: runtime.to_string(),
                            message: compat.message,
                        });
                    }
                    CompatibilityLevel::Incompatible | CompatibilityLevel::Warning => {
                        report.warn(format!("Migration {}: {}", migration.version, compat.message));
                    }
                    CompatibilityLevel::Compatible => {}
                }
            }

            self.apply_one(store, migration, runtime_label.as_deref(), options, report)?;
            satisfied.insert(migration.version.clone());
        }

        if report.outcomes.is_empty() {
            log::info!("No pending migrations");
        }
        Ok(())
    }

    /// Execute one migration and record its outcome. A failed step is
    /// recorded as `failed` before the error is returned.
    fn apply_one(
        &self,
        store: &dyn HistoryStore,
        migration: &Migration,
        runtime: Option<&str>,
        options: &MigrateOptions,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let outcome = |status: RecordStatus, execution_time_ms: u64, error: Option<String>| MigrationOutcome {
            version: migration.version.clone(),
            name: migration.name.clone(),
            status,
            checksum: migration.checksum.clone(),
            execution_time_ms,
            error,
        };

        if options.dry_run {
            log::info!("[dry run] Would apply migration {} ({})", migration.version, migration.name);
            report.push(outcome(RecordStatus::DryRun, 0, None));
            return Ok(());
        }

        // Another runner may have recorded it since the history was read.
        if let Some(existing) = store.find_record(&migration.version)? {
            if existing.is_applied() {
                if checksums_match(&existing.checksum, &migration.checksum) {
                    log::info!("Migration {} already applied, skipping", migration.version);
                    report.push(outcome(RecordStatus::Skipped, 0, None));
                    return Ok(());
                }
                return Err(MigrationError::ChecksumMismatch {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    stored: existing.checksum,
                    current: migration.checksum.clone(),
                });
            }
        }

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "migration.apply",
            version = %migration.version,
            name = %migration.name
        )
        .entered();

        match store.apply(migration, runtime, options.statement_timeout) {
            Ok(record) => {
                log::info!(
                    "Applied migration {} ({}) in {}ms",
                    migration.version,
                    migration.name,
                    record.execution_time_ms
                );
                report.push(outcome(RecordStatus::Applied, record.execution_time_ms.max(0) as u64, None));
                Ok(())
            }
            Err(e) => {
                log::error!("Migration {} ({}) failed: {}", migration.version, migration.name, e);
                report.push(outcome(RecordStatus::Failed, 0, Some(e.to_string())));
                Err(MigrationError::ExecutionFailed {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    statement: e.statement,
                    source: e.source,
                })
            }
        }
    }

    /// Roll back every applied migration above `target`, highest first.
    pub fn rollback(
        &self,
        store: &dyn HistoryStore,
        target: &MigrationVersion,
        options: &RollbackOptions,
    ) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::new(options.dry_run);
        self.rollback_into(store, target, options, &mut report)?;
        Ok(report)
    }

    pub fn rollback_into(
        &self,
        store: &dyn HistoryStore,
        target: &MigrationVersion,
        options: &RollbackOptions,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let mut applied = store.applied_records()?;
        applied.retain(|r| r.version > *target);
        applied.sort_by(|a, b| b.version.cmp(&a.version));

        if applied.is_empty() {
            log::info!("Nothing to roll back above {}", target);
            return Ok(());
        }

        for record in applied {
            let migration = self.migrations.get(&record.version).ok_or_else(|| {
                MigrationError::RollbackUnavailable {
                    version: record.version.clone(),
                    reason: "migration is not in the migration set".to_string(),
                }
            })?;
            if !migration.is_reversible() {
                return Err(MigrationError::RollbackUnavailable {
                    version: record.version.clone(),
                    reason: "no down SQL".to_string(),
                });
            }

            let outcome = |status: RecordStatus, execution_time_ms: u64, error: Option<String>| MigrationOutcome {
                version: migration.version.clone(),
                name: migration.name.clone(),
                status,
                checksum: record.checksum.clone(),
                execution_time_ms,
                error,
            };

            if options.dry_run {
                log::info!("[dry run] Would roll back migration {} ({})", migration.version, migration.name);
                report.push(outcome(RecordStatus::DryRun, 0, None));
                continue;
            }

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!("migration.rollback", version = %migration.version).entered();

            match store.revert(migration, options.statement_timeout) {
                Ok(elapsed) => {
                    log::info!(
                        "Rolled back migration {} ({}) in {}ms",
                        migration.version,
                        migration.name,
                        elapsed
                    );
                    report.push(outcome(RecordStatus::RolledBack, elapsed, None));
                }
                Err(e) => {
                    report.push(outcome(RecordStatus::Failed, 0, Some(e.to_string())));
                    return Err(MigrationError::ExecutionFailed {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        statement: e.statement,
                        source: e.source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Migrate a fresh target. Creates the history table if absent; a target
    /// that is already up to date reports no changes.
    pub fn bootstrap(&self, store: &dyn HistoryStore, options: &MigrateOptions) -> Result<MigrationReport, MigrationError> {
        if !options.dry_run {
            store.ensure_history_table()?;
        }
        self.migrate(store, options)
    }

    /// Highest minimum runtime declared by any applied migration.
    pub fn minimum_required_runtime(&self, store: &dyn HistoryStore) -> Result<Option<semver::Version>, MigrationError> {
        let applied = store.applied_records()?;
        Ok(applied
            .iter()
            .filter_map(|r| self.migrations.get(&r.version))
            .filter_map(|m| m.min_runtime_version.clone())
            .max())
    }

    /// Compatibility of the target's applied migrations with `runtime`.
    pub fn compatibility_matrix(
        &self,
        store: &dyn HistoryStore,
        runtime: &semver::Version,
    ) -> Result<CompatibilityMatrix, MigrationError> {
        let status = self.status(store)?;
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        for record in &status.applied {
            let Some(migration) = self.migrations.get(&record.version) else {
                continue;
            };
            let compat = check_compatibility(migration, runtime);
            match compat.status {
                CompatibilityLevel::Incompatible => {
                    issues.push(format!("Migration {}: {}", record.version, compat.message))
                }
                CompatibilityLevel::Warning => {
                    warnings.push(format!("Migration {}: {}", record.version, compat.message))
                }
                CompatibilityLevel::Compatible => {}
            }
        }

        let overall_status = if !issues.is_empty() {
            CompatibilityLevel::Incompatible
        } else if !warnings.is_empty() {
            CompatibilityLevel::Warning
        } else {
            CompatibilityLevel::Compatible
        };

        Ok(CompatibilityMatrix {
            runtime_version: runtime.to_string(),
            current_db_version: status.current_version().map(|v| v.to_string()),
            applied: status.applied,
            pending: status.pending,
            issues,
            warnings,
            overall_status,
        })
    }

    /// Probe for CI/CD: 0 up to date and compatible, 1 pending work,
    /// 2 incompatible runtime.
    pub fn check_health(&self, store: &dyn HistoryStore, runtime: &semver::Version) -> Result<HealthCheck, MigrationError> {
        if let Some(min) = self.minimum_required_runtime(store)? {
            if *runtime < min {
                return Ok(HealthCheck {
                    exit_code: exit_code::INCOMPATIBLE,
                    message: format!("Runtime version {runtime} is below minimum required {min}"),
                });
            }
        }

        let status = self.status(store)?;
        if !status.pending.is_empty() {
            return Ok(HealthCheck {
                exit_code: exit_code::PENDING,
                message: format!("Pending migrations: {}", status.pending.len()),
            });
        }
        Ok(HealthCheck {
            exit_code: exit_code::OK,
            message: "Database is up to date and compatible".to_string(),
        })
    }

    /// Versions recorded as applied but missing from the set; fails on the
    /// first applied migration whose content changed.
    fn verify_applied(&self, applied: &[MigrationRecord]) -> Result<Vec<MigrationVersion>, MigrationError> {
        let mut unknown = Vec::new();
        for record in applied {
            match self.migrations.get(&record.version) {
                Some(migration) => {
                    let current = migration.current_checksum();
                    if !checksums_match(&record.checksum, &current) {
                        return Err(MigrationError::ChecksumMismatch {
                            version: record.version.clone(),
                            name: migration.name.clone(),
                            stored: record.checksum.clone(),
                            current,
                        });
                    }
                }
                None => unknown.push(record.version.clone()),
            }
        }
        Ok(unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryHistoryStore;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    fn rt(s: &str) -> semver::Version {
        semver::Version::parse(s).unwrap()
    }

    fn scenario_set() -> MigrationSet {
        [
            Migration::new(v("1.0.0"), "initial_schema", "CREATE TABLE users (id SERIAL PRIMARY KEY);")
                .with_down("DROP TABLE users;"),
            Migration::new(v("1.1.0"), "add_email", "ALTER TABLE users ADD COLUMN email TEXT;")
                .with_down("ALTER TABLE users DROP COLUMN email;")
                .with_dependencies(vec![v("1.0.0")])
                .with_runtime_bounds(Some(rt("1.1.0")), None),
        ]
        .into_iter()
        .collect()
    }

    fn runtime(s: &str) -> MigrateOptions {
        MigrateOptions {
            runtime_version: Some(rt(s)),
            ..MigrateOptions::default()
        }
    }

    #[test]
    fn test_scenario_runtime_gates_second_migration() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());

        let mut report = MigrationReport::new(false);
        let err = migrator
            .migrate_into(&store, &runtime("1.0.0"), &mut report)
            .unwrap_err();
        assert!(matches!(err, MigrationError::IncompatibleRuntime { ref version, .. } if *version == v("1.1.0")));
        assert_eq!(report.versions(RecordStatus::Applied), vec![v("1.0.0")]);
        assert_eq!(store.applied_versions(), vec![v("1.0.0")]);

        let first_applied_at = store.record(&v("1.0.0")).unwrap().applied_at;
        let report = migrator.migrate(&store, &runtime("1.1.0")).unwrap();
        assert_eq!(report.versions(RecordStatus::Applied), vec![v("1.1.0")]);
        assert_eq!(store.applied_versions(), vec![v("1.0.0"), v("1.1.0")]);
        assert_eq!(store.record(&v("1.0.0")).unwrap().applied_at, first_applied_at);
        assert_eq!(store.record(&v("1.1.0")).unwrap().runtime_version.as_deref(), Some("1.1.0"));
    }

    #[test]
    fn test_incompatible_runtime_can_be_downgraded_to_warning() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        let options = MigrateOptions {
            fail_on_incompatible: false,
            ..runtime("1.0.0")
        };
        let report = migrator.migrate(&store, &options).unwrap();
        assert_eq!(report.changes(), 2);
        assert!(report.warnings.iter().any(|w| w.contains("below minimum required 1.1.0")));
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        assert_eq!(migrator.migrate(&store, &MigrateOptions::default()).unwrap().changes(), 2);

        let executed = store.executed().len();
        let report = migrator.migrate(&store, &MigrateOptions::default()).unwrap();
        assert_eq!(report.changes(), 0);
        assert!(report.outcomes.is_empty());
        assert!(migrator.status(&store).unwrap().pending.is_empty());
        assert_eq!(store.executed().len(), executed);
    }

    #[test]
    fn test_applies_ascending_and_rolls_back_descending() {
        let store = MemoryHistoryStore::new();
        let set: MigrationSet = ["1.2.0", "1.0.0", "1.10.0"]
            .iter()
            .map(|s| Migration::new(v(s), format!("m{s}"), format!("SELECT '{s}'")).with_down(format!("SELECT 'undo {s}'")))
            .collect();
        let migrator = Migrator::new(set);

        let report = migrator.migrate(&store, &MigrateOptions::default()).unwrap();
        assert_eq!(
            report.versions(RecordStatus::Applied),
            vec![v("1.0.0"), v("1.2.0"), v("1.10.0")]
        );

        let report = migrator
            .rollback(&store, &v("1.0.0"), &RollbackOptions::default())
            .unwrap();
        assert_eq!(report.versions(RecordStatus::RolledBack), vec![v("1.10.0"), v("1.2.0")]);
        assert_eq!(store.applied_versions(), vec![v("1.0.0")]);
        assert_eq!(store.executed().last().map(String::as_str), Some("SELECT 'undo 1.2.0'"));
    }

    #[test]
    fn test_modified_applied_migration_is_rejected() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        migrator.migrate(&store, &MigrateOptions::default()).unwrap();

        let mut edited = scenario_set();
        let mut first = edited.get(&v("1.0.0")).unwrap().clone();
        first.up_sql.push_str("\nCREATE INDEX idx_users_id ON users (id);");
        edited.insert(first);
        let edited = Migrator::new(edited);

        let executed = store.executed().len();
        let err = edited.migrate(&store, &MigrateOptions::default()).unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { ref version, .. } if *version == v("1.0.0")));
        assert_eq!(store.executed().len(), executed);
        assert!(edited.status(&store).is_err());
    }

    #[test]
    fn test_unapplied_dependency_blocks_execution() {
        let store = MemoryHistoryStore::new();
        let set: MigrationSet = [
            Migration::new(v("1.0.0"), "a", "SELECT 1"),
            Migration::new(v("1.1.0"), "b", "SELECT 2").with_dependencies(vec![v("1.0.5")]),
        ]
        .into_iter()
        .collect();
        let migrator = Migrator::new(set);

        let mut report = MigrationReport::new(false);
        let err = migrator
            .migrate_into(&store, &MigrateOptions::default(), &mut report)
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnsatisfiedDependency { ref dependency, .. } if *dependency == v("1.0.5")
        ));
        assert_eq!(store.executed(), vec!["SELECT 1".to_string()]);
    }

    #[test]
    fn test_failed_statement_keeps_earlier_commits() {
        let store = MemoryHistoryStore::new();
        store.fail_on("broken");
        let set: MigrationSet = [
            Migration::new(v("1.0.0"), "ok", "CREATE TABLE a (id INT);"),
            Migration::new(v("1.1.0"), "bad", "CREATE TABLE b (id INT);\nCREATE TABLE broken (;"),
        ]
        .into_iter()
        .collect();
        let migrator = Migrator::new(set);

        let mut report = MigrationReport::new(false);
        let err = migrator
            .migrate_into(&store, &MigrateOptions::default(), &mut report)
            .unwrap_err();
        match err {
            MigrationError::ExecutionFailed { statement, .. } => {
                assert_eq!(statement.as_deref(), Some("CREATE TABLE broken ("));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.applied_versions(), vec![v("1.0.0")]);
        assert_eq!(report.count(RecordStatus::Failed), 1);
    }

    #[test]
    fn test_dry_run_leaves_target_untouched() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        let options = MigrateOptions {
            dry_run: true,
            ..MigrateOptions::default()
        };
        let report = migrator.migrate(&store, &options).unwrap();
        assert_eq!(report.count(RecordStatus::DryRun), 2);
        assert!(!store.is_initialized());
        assert!(store.executed().is_empty());
    }

    #[test]
    fn test_max_version_caps_pending_work() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        let options = MigrateOptions {
            max_version: Some(v("1.0.0")),
            ..MigrateOptions::default()
        };
        migrator.migrate(&store, &options).unwrap();
        assert_eq!(store.applied_versions(), vec![v("1.0.0")]);
    }

    #[test]
    fn test_rollback_without_down_sql_is_unavailable() {
        let store = MemoryHistoryStore::new();
        let set: MigrationSet = [
            Migration::new(v("1.0.0"), "a", "SELECT 1").with_down("SELECT -1"),
            Migration::new(v("1.1.0"), "b", "SELECT 2"),
        ]
        .into_iter()
        .collect();
        let migrator = Migrator::new(set);
        migrator.migrate(&store, &MigrateOptions::default()).unwrap();

        let err = migrator
            .rollback(&store, &v("0.0.0"), &RollbackOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::RollbackUnavailable { ref version, .. } if *version == v("1.1.0")));
        assert_eq!(store.applied_versions(), vec![v("1.0.0"), v("1.1.0")]);
    }

    #[test]
    fn test_bootstrap_creates_history_once() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        assert_eq!(migrator.bootstrap(&store, &MigrateOptions::default()).unwrap().changes(), 2);
        assert!(store.is_initialized());
        assert_eq!(migrator.bootstrap(&store, &MigrateOptions::default()).unwrap().changes(), 0);
    }

    #[test]
    fn test_health_and_matrix() {
        let store = MemoryHistoryStore::new();
        let migrator = Migrator::new(scenario_set());
        assert_eq!(migrator.check_health(&store, &rt("1.1.0")).unwrap().exit_code, exit_code::PENDING);

        migrator.migrate(&store, &MigrateOptions::default()).unwrap();
        assert_eq!(migrator.minimum_required_runtime(&store).unwrap(), Some(rt("1.1.0")));
        assert_eq!(migrator.check_health(&store, &rt("1.1.0")).unwrap().exit_code, exit_code::OK);
        assert_eq!(migrator.check_health(&store, &rt("1.0.0")).unwrap().exit_code, exit_code::INCOMPATIBLE);

        let matrix = migrator.compatibility_matrix(&store, &rt("1.0.0")).unwrap();
        assert_eq!(matrix.overall_status, CompatibilityLevel::Incompatible);
        assert_eq!(matrix.current_db_version.as_deref(), Some("1.1.0"));
        assert_eq!(matrix.issues.len(), 1);

        let matrix = migrator.compatibility_matrix(&store, &rt("2.0.0")).unwrap();
        assert_eq!(matrix.overall_status, CompatibilityLevel::Warning);
    }
}
