//! Manifest directories on disk

use schemaguard::manifest::{self, ManifestError, SeedData, DEFAULT_ENVIRONMENT};
use schemaguard::migration::MigrationVersion;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn v(s: &str) -> MigrationVersion {
    MigrationVersion::parse(s).unwrap()
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn sample_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "metadata.json",
        r#"{"version": "2.3.0", "author": "platform", "min_runtime_version": "2.0.0", "tags": ["billing"]}"#,
    );
    write(
        root,
        "migrations/V001__create_users.sql",
        "-- description: Users table\n-- UP\nCREATE TABLE users (id BIGINT PRIMARY KEY, email TEXT);\n\n-- DOWN\nDROP TABLE users;\n",
    );
    write(
        root,
        "migrations/V002__create_orders.sql",
        "-- depends-on: V001\nCREATE TABLE orders (id BIGINT PRIMARY KEY, user_id BIGINT REFERENCES users (id));\n",
    );
    write(root, "migrations/README.md", "not a migration");
    write(root, "migrations/002_orders.sql", "SELECT 1;");
    write(
        root,
        "seeds/plans.sql",
        "-- default plans\nINSERT INTO plans (name)\n    VALUES ('free');\nINSERT INTO plans (name) VALUES ('pro');\n",
    );
    write(root, "seeds/staging/users.sql", "INSERT INTO users (id, email) VALUES (1, 'qa@example.com');");
    dir
}

#[test]
fn test_parse_directory() {
    let dir = sample_dir();
    let manifest = manifest::parse(dir.path()).unwrap();

    assert_eq!(manifest.version, "2.3.0");
    assert_eq!(manifest.author, "platform");
    assert_eq!(manifest.description, "Database Manifest");
    assert_eq!(manifest.metadata.tags, vec!["billing".to_string()]);
    assert_eq!(manifest.metadata.min_runtime_version, Some(semver::Version::new(2, 0, 0)));

    let versions: Vec<_> = manifest.migrations.iter().map(|m| m.version.clone()).collect();
    assert_eq!(versions, vec![v("V001"), v("V002")]);

    let users = &manifest.migrations[0];
    assert_eq!(users.name, "create_users");
    assert_eq!(users.description, "Users table");
    assert_eq!(users.down_sql.as_deref(), Some("DROP TABLE users;"));

    let orders = &manifest.migrations[1];
    assert_eq!(orders.dependencies, vec![v("V001")]);
    assert!(!orders.is_reversible());

    assert_eq!(manifest.seed_data.len(), 2);
    let plans = &manifest.seed_data[0];
    assert_eq!(plans.environment, DEFAULT_ENVIRONMENT);
    assert_eq!(plans.table_name, "plans");
    assert_eq!(
        plans.statements,
        vec![
            "INSERT INTO plans (name) VALUES ('free')".to_string(),
            "INSERT INTO plans (name) VALUES ('pro')".to_string(),
        ]
    );
    assert_eq!(manifest.seeds_for("staging").count(), 1);

    manifest.validate().unwrap();
}

#[test]
fn test_migrations_inherit_manifest_runtime_bounds() {
    let dir = sample_dir();
    let set = manifest::parse(dir.path()).unwrap().migration_set();
    assert!(set
        .iter()
        .all(|m| m.min_runtime_version == Some(semver::Version::new(2, 0, 0))));
}

#[test]
fn test_written_manifest_parses_back_unchanged() {
    let dir = sample_dir();
    let original = manifest::parse(dir.path()).unwrap();

    let out = TempDir::new().unwrap();
    manifest::write(&original, out.path()).unwrap();
    let reparsed = manifest::parse(out.path()).unwrap();

    assert_eq!(reparsed, original);
    assert_eq!(reparsed.checksum(), original.checksum());
    assert!(out.path().join("seeds/default/plans.sql").is_file());
}

#[test]
fn test_checksum_tracks_content() {
    let dir = sample_dir();
    let manifest = manifest::parse(dir.path()).unwrap();
    let mut changed = manifest.clone();
    changed.seed_data.push(SeedData::new("staging", "orders", vec!["INSERT INTO orders VALUES (1, 1)".into()]));
    assert_ne!(manifest.checksum(), changed.checksum());
}

#[test]
fn test_validation_lists_every_problem() {
    let dir = sample_dir();
    let mut manifest = manifest::parse(dir.path()).unwrap();
    manifest.migrations[0].up_sql = "DROP TABLE users;".into();
    let duplicate = manifest.migrations[1].clone();
    manifest.migrations.push(duplicate);

    match manifest.validate() {
        Err(ManifestError::Invalid(problems)) => {
            assert_eq!(problems.len(), 2);
            assert!(problems.iter().any(|p| p.contains("checksum does not match")));
            assert!(problems.iter().any(|p| p.contains("duplicate migration version: V002")));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn test_missing_directory() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        manifest::parse(dir.path().join("absent")),
        Err(ManifestError::NotFound(_))
    ));
}
