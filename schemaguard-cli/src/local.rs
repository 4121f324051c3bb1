//! Commands that work on local files or connect to a database directly

use crate::{AgentCommand, Cli, KeysCommand, ManifestCommand, MigrateCommand, SchemaCommand};
use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use colored::Colorize;
use schemaguard::agent::auth::issue_key;
use schemaguard::config::{AgentConfig, DatabaseConfig};
use schemaguard::inspector::{capture_live, compare, expected_state};
use schemaguard::metadb::{MetadataStore, PgMetadataStore};
use schemaguard::migration::{
    exit_code, parse_runtime_version, CompatibilityLevel, MigrateOptions, MigrationLockGuard, MigrationRegistry,
    MigrationReport, MigrationVersion, Migrator, PgHistoryStore, RecordStatus, RollbackOptions,
};
use schemaguard::{connect, manifest, MayPostgresExecutor};
use std::fs;
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

fn executor(cli: &Cli) -> anyhow::Result<MayPostgresExecutor> {
    let url = cli.database_url()?;
    let client = connect(&url).context("Error connecting to database")?;
    Ok(MayPostgresExecutor::new(client))
}

fn print_report(report: &MigrationReport) {
    for outcome in &report.outcomes {
        let marker = match outcome.status {
            RecordStatus::Applied | RecordStatus::RolledBack => "✓".green(),
            RecordStatus::DryRun | RecordStatus::Skipped => "•".cyan(),
            RecordStatus::Failed => "✗".red(),
        };
        println!(
            "  {} {} {} ({}, {}ms)",
            marker,
            outcome.version,
            outcome.name,
            outcome.status.as_str(),
            outcome.execution_time_ms
        );
        if let Some(error) = &outcome.error {
            println!("      {}", error.red());
        }
    }
    for warning in &report.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
}

pub fn migrate(cli: &Cli, command: &MigrateCommand) -> anyhow::Result<i32> {
    if let MigrateCommand::New { version, name } = command {
        let dir = MigrationRegistry::scaffold(&cli.migrations_dir, version, name)?;
        println!("✅ Created migration {}", dir.display());
        println!("   Edit up.sql (and down.sql) to implement it");
        return Ok(exit_code::OK);
    }

    let registry = MigrationRegistry::load(&cli.migrations_dir)
        .with_context(|| format!("Failed to load migrations from {}", cli.migrations_dir.display()))?;
    let migrator = Migrator::from_registry(&registry);
    let executor = executor(cli)?;
    let store = PgHistoryStore::new(&executor);

    match command {
        MigrateCommand::Status => {
            let status = migrator.status(&store)?;
            println!("\n📊 Migration Status\n");
            if status.applied.is_empty() {
                println!("✅ Applied Migrations: None");
            } else {
                println!("✅ Applied Migrations ({}):", status.applied.len());
                for record in &status.applied {
                    println!(
                        "  ✓ {} {} ({}, {}ms)",
                        record.version,
                        record.name,
                        record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        record.execution_time_ms
                    );
                }
            }
            println!();
            if status.pending.is_empty() {
                println!("⏳ Pending Migrations: None");
            } else {
                println!("⏳ Pending Migrations ({}):", status.pending.len());
                for pending in &status.pending {
                    println!("  ⏳ {} {}", pending.version, pending.name);
                }
            }
            for version in &status.unknown {
                println!("  {} {} is applied but not in the registry", "⚠".yellow(), version);
            }
            println!(
                "\n📈 Summary: {} applied, {} pending ({})",
                status.applied.len(),
                status.pending.len(),
                status.summary()
            );
            Ok(if status.is_up_to_date() {
                exit_code::OK
            } else {
                exit_code::PENDING
            })
        }

        MigrateCommand::Up {
            target,
            runtime_version,
            force,
            dry_run,
        } => {
            let options = MigrateOptions {
                dry_run: *dry_run,
                max_version: target.as_deref().map(MigrationVersion::parse).transpose()?,
                runtime_version: runtime_version.as_deref().map(parse_runtime_version).transpose()?,
                fail_on_incompatible: !force,
                statement_timeout: None,
            };
            let _lock = MigrationLockGuard::acquire(&store, Some(LOCK_TIMEOUT))?;
            println!("Applying migrations...");
            let report = migrator.migrate(&store, &options)?;
            print_report(&report);
            println!(
                "✅ {} migration(s) {}",
                report.changes(),
                if *dry_run { "would be applied" } else { "applied" }
            );
            Ok(exit_code::OK)
        }

        MigrateCommand::Down { to, dry_run } => {
            let target = MigrationVersion::parse(to)?;
            let options = RollbackOptions {
                dry_run: *dry_run,
                statement_timeout: None,
            };
            let _lock = MigrationLockGuard::acquire(&store, Some(LOCK_TIMEOUT))?;
            println!("Rolling back to {}...", target);
            let report = migrator.rollback(&store, &target, &options)?;
            print_report(&report);
            println!(
                "✅ {} migration(s) {}",
                report.changes(),
                if *dry_run { "would be rolled back" } else { "rolled back" }
            );
            Ok(exit_code::OK)
        }

        MigrateCommand::Check { runtime_version } => {
            let runtime = parse_runtime_version(runtime_version)?;
            let health = migrator.check_health(&store, &runtime)?;
            if health.is_healthy() {
                println!("✅ {}", health.message);
            } else {
                println!("{} {}", "⚠".yellow(), health.message);
            }
            Ok(health.exit_code)
        }

        MigrateCommand::Compat { runtime_version } => {
            let runtime = parse_runtime_version(runtime_version)?;
            let matrix = migrator.compatibility_matrix(&store, &runtime)?;
            println!("\n🧭 Compatibility with runtime {}\n", matrix.runtime_version);
            println!(
                "Database version: {}",
                matrix.current_db_version.as_deref().unwrap_or("none")
            );
            println!("Applied: {}, pending: {}", matrix.applied.len(), matrix.pending.len());
            for issue in &matrix.issues {
                println!("  {} {}", "✗".red(), issue);
            }
            for warning in &matrix.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
            Ok(match matrix.overall_status {
                CompatibilityLevel::Incompatible => exit_code::INCOMPATIBLE,
                CompatibilityLevel::Warning | CompatibilityLevel::Compatible => exit_code::OK,
            })
        }

        MigrateCommand::Validate => {
            for warning in registry.validate_files() {
                println!("  {} {}", "⚠".yellow(), warning);
            }
            println!("Validating checksums...");
            migrator.validate_checksums(&store)?;
            println!("✅ All checksums valid");
            Ok(exit_code::OK)
        }

        MigrateCommand::New { .. } => Ok(exit_code::OK),
    }
}

pub fn manifest(command: &ManifestCommand) -> anyhow::Result<i32> {
    match command {
        ManifestCommand::Validate { path } => {
            let manifest = manifest::parse(path)?;
            match manifest.validate() {
                Ok(()) => {
                    println!(
                        "✅ Manifest {} is valid ({} migrations, {} seed tables)",
                        manifest.version,
                        manifest.migrations.len(),
                        manifest.seed_data.len()
                    );
                    Ok(exit_code::OK)
                }
                Err(schemaguard::manifest::ManifestError::Invalid(problems)) => {
                    println!("❌ Manifest {} has {} problem(s):", path.display(), problems.len());
                    for problem in problems {
                        println!("  {} {}", "✗".red(), problem);
                    }
                    Ok(exit_code::INCOMPATIBLE)
                }
                Err(e) => Err(e.into()),
            }
        }

        ManifestCommand::Show { path, json } => {
            let manifest = manifest::parse(path)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
                return Ok(exit_code::OK);
            }
            println!("\n📋 Manifest {}\n", path.display());
            println!("Version: {}", manifest.version);
            println!("Description: {}", manifest.description);
            println!("Author: {}", manifest.author);
            println!("Created At: {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Checksum: {}", manifest.checksum());
            println!("\nMigrations ({}):", manifest.migrations.len());
            for migration in &manifest.migrations {
                let reversible = if migration.is_reversible() { "" } else { " (irreversible)" };
                println!("  {} {}{}", migration.version, migration.name, reversible);
            }
            if !manifest.seed_data.is_empty() {
                println!("\nSeed Data ({}):", manifest.seed_data.len());
                for seed in &manifest.seed_data {
                    println!(
                        "  {}/{} ({} statements)",
                        seed.environment,
                        seed.table_name,
                        seed.statements.len()
                    );
                }
            }
            Ok(exit_code::OK)
        }
    }
}

pub fn schema(cli: &Cli, command: &SchemaCommand) -> anyhow::Result<i32> {
    let executor = executor(cli)?;
    match command {
        SchemaCommand::Capture { schema, output } => {
            let state = capture_live(&executor, schema, None)?;
            let json = serde_json::to_string_pretty(&state)?;
            match output {
                Some(path) => {
                    fs::write(path, format!("{json}\n"))
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "✅ Captured {} tables, {} indexes, {} functions to {}",
                        state.tables.len(),
                        state.indexes.len(),
                        state.functions.len(),
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
            Ok(exit_code::OK)
        }

        SchemaCommand::Compare { manifest, schema } => {
            let manifest = manifest::parse(manifest)?;
            manifest.validate()?;
            let expected = expected_state(&executor, &manifest.migration_set(), None)?;
            let actual = capture_live(&executor, schema, None)?;
            let comparison = compare(&expected, &actual);
            if comparison.is_identical {
                println!("✅ Schema {} matches manifest {}", schema, manifest.version);
                return Ok(exit_code::OK);
            }
            println!("{} Schema {} drifted from manifest {}:", "⚠".yellow(), schema, manifest.version);
            for drift in &comparison.drift {
                println!("  • {}", drift);
            }
            Ok(exit_code::PENDING)
        }
    }
}

pub fn agent(command: &AgentCommand) -> anyhow::Result<i32> {
    match command {
        AgentCommand::Serve { config } => {
            let config = AgentConfig::load_from(config)?;
            log::info!("Starting agent on {}", config.bind_address);
            schemaguard::agent::run(&config)?;
            Ok(exit_code::OK)
        }
    }
}

pub fn keys(cli: &Cli, command: &KeysCommand) -> anyhow::Result<i32> {
    let store = PgMetadataStore::connect(&DatabaseConfig {
        url: cli.database_url()?,
        ..DatabaseConfig::default()
    })?;
    store.initialize()?;

    match command {
        KeysCommand::Create {
            client_id,
            description,
            expires_in_days,
            permissions,
        } => {
            if store.find_api_key(client_id)?.is_some_and(|key| key.is_active) {
                anyhow::bail!("Client {} already has an active key; revoke it first", client_id);
            }
            let expires_at = expires_in_days.map(|days| Utc::now() + ChronoDuration::days(days));
            let created_by = std::env::var("USER").ok();
            let issued = issue_key(client_id, description.clone(), permissions.clone(), expires_at, created_by);
            store.register_api_key(&issued.key)?;
            println!("✅ Created key for client {}", client_id.bold());
            println!("   API key: {}", issued.secret);
            println!("   Store it now; it cannot be shown again.");
            Ok(exit_code::OK)
        }

        KeysCommand::Revoke { client_id } => {
            if store.revoke_api_key(client_id)? {
                println!("✅ Revoked key for client {}", client_id);
                Ok(exit_code::OK)
            } else {
                anyhow::bail!("No key for client {}", client_id)
            }
        }

        KeysCommand::List => {
            let keys = store.list_api_keys()?;
            if keys.is_empty() {
                println!("No keys issued");
            }
            let now = Utc::now();
            for key in keys {
                let state = if !key.is_active {
                    "revoked".red()
                } else if key.is_expired_at(now) {
                    "expired".yellow()
                } else {
                    "active".green()
                };
                let last_used = key
                    .last_used_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} [{}] used {} times, last {}{}",
                    key.key_id,
                    state,
                    key.usage_count,
                    last_used,
                    key.description.map(|d| format!(" - {d}")).unwrap_or_default()
                );
            }
            Ok(exit_code::OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use schemaguard::migration::Migration;
    use schemaguard::Manifest;

    #[test]
    fn test_migrate_new_needs_no_database() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["schemaguard", "--migrations-dir", root, "migrate", "new", "1.2.0", "add_orders"])
            .unwrap();
        let crate::Commands::Migrate { command } = &cli.command else {
            panic!("parsed the wrong command");
        };

        assert_eq!(migrate(&cli, command).unwrap(), exit_code::OK);
        assert!(dir.path().join("1.2.0").join("metadata.json").is_file());
        assert!(migrate(&cli, command).is_err());
    }

    #[test]
    fn test_manifest_validate_and_show() {
        let dir = tempfile::tempdir().unwrap();
        let release = Manifest {
            migrations: vec![Migration::new(
                MigrationVersion::parse("V001").unwrap(),
                "create_orders",
                "CREATE TABLE orders (id BIGINT PRIMARY KEY);",
            )
            .with_down("DROP TABLE orders;")],
            ..Manifest::default()
        };
        manifest::write(&release, dir.path()).unwrap();

        let path = dir.path().to_path_buf();
        assert_eq!(manifest(&ManifestCommand::Validate { path: path.clone() }).unwrap(), exit_code::OK);
        assert_eq!(manifest(&ManifestCommand::Show { path, json: true }).unwrap(), exit_code::OK);
    }
}
