//! Directory form of a [`Manifest`]
//!
//! [`write`] is the inverse of [`parse`]: parsing a written manifest yields
//! a manifest equal to the one written.

use super::{Manifest, ManifestError, ManifestMetadata, SeedData, DEFAULT_ENVIRONMENT};
use crate::migration::{Migration, MigrationVersion};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";
pub const MIGRATIONS_DIR: &str = "migrations";
pub const SEEDS_DIR: &str = "seeds";

const UP_MARKER: &str = "-- UP";
const DOWN_MARKER: &str = "-- DOWN";
const DESCRIPTION_HEADER: &str = "-- description:";
const DEPENDS_HEADER: &str = "-- depends-on:";

static MIGRATION_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(V\d+)__(.+)\.sql$").expect("static migration file pattern"));

/// `metadata.json` as stored on disk
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    metadata: ManifestMetadata,
}

/// Read the manifest rooted at `root`.
pub fn parse(root: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(ManifestError::NotFound(root.to_path_buf()));
    }

    let mut manifest = Manifest::default();
    let metadata_path = root.join(METADATA_FILE);
    if metadata_path.is_file() {
        let content = fs::read_to_string(&metadata_path).map_err(ManifestError::io(&metadata_path))?;
        let file: MetadataFile =
            serde_json::from_str(&content).map_err(|e| ManifestError::MalformedMetadata {
                path: metadata_path.clone(),
                reason: e.to_string(),
            })?;
        if let Some(version) = file.version {
            manifest.version = version;
        }
        if let Some(description) = file.description {
            manifest.description = description;
        }
        if let Some(author) = file.author {
            manifest.author = author;
        }
        if let Some(created_at) = file.created_at {
            manifest.created_at = created_at;
        }
        manifest.metadata = file.metadata;
    }

    manifest.migrations = parse_migrations(&root.join(MIGRATIONS_DIR))?;
    manifest.seed_data = parse_seeds(&root.join(SEEDS_DIR))?;
    log::debug!(
        "Parsed manifest {} from {}: {} migrations, {} seed files",
        manifest.version,
        root.display(),
        manifest.migrations.len(),
        manifest.seed_data.len()
    );
    Ok(manifest)
}

fn parse_migrations(dir: &Path) -> Result<Vec<Migration>, ManifestError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for path in sorted_entries(dir)? {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(captures) = MIGRATION_FILE.captures(file_name) else {
            log::debug!("Ignoring non-migration file {}", path.display());
            continue;
        };
        if !path.is_file() {
            continue;
        }

        let version = MigrationVersion::parse(&captures[1]).map_err(|e| ManifestError::InvalidMigration {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let content = fs::read_to_string(&path).map_err(ManifestError::io(&path))?;
        let sections = split_sections(&content).map_err(|reason| ManifestError::InvalidMigration {
            path: path.clone(),
            reason,
        })?;

        let mut migration = Migration::new(version, &captures[2], sections.up)
            .with_description(sections.description)
            .with_dependencies(sections.dependencies);
        if let Some(down) = sections.down {
            migration = migration.with_down(down);
        }
        migrations.push(migration);
    }
    migrations.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(migrations)
}

struct Sections {
    description: String,
    dependencies: Vec<MigrationVersion>,
    up: String,
    down: Option<String>,
}

/// Split a migration file into its header, up section and down section.
fn split_sections(content: &str) -> Result<Sections, String> {
    enum Part {
        Header,
        Up,
        Down,
    }

    let mut part = Part::Header;
    let mut description = String::new();
    let mut dependencies = Vec::new();
    let mut up = Vec::new();
    let mut down = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        match part {
            Part::Header => {
                if let Some(text) = trimmed.strip_prefix(DESCRIPTION_HEADER) {
                    description = text.trim().to_string();
                } else if let Some(list) = trimmed.strip_prefix(DEPENDS_HEADER) {
                    for dep in list.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                        dependencies.push(MigrationVersion::parse(dep).map_err(|e| e.to_string())?);
                    }
                } else if trimmed == UP_MARKER {
                    part = Part::Up;
                } else if trimmed == DOWN_MARKER {
                    part = Part::Down;
                } else if !trimmed.is_empty() {
                    part = Part::Up;
                    up.push(line);
                }
            }
            Part::Up if trimmed == DOWN_MARKER => part = Part::Down,
            Part::Up => up.push(line),
            Part::Down => down.push(line),
        }
    }

    let down = down.join("\n").trim().to_string();
    Ok(Sections {
        description,
        dependencies,
        up: up.join("\n").trim().to_string(),
        down: (!down.is_empty()).then_some(down),
    })
}

fn parse_seeds(dir: &Path) -> Result<Vec<SeedData>, ManifestError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut seeds = Vec::new();
    for path in sorted_entries(dir)? {
        if path.is_dir() {
            let Some(environment) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            for file in sorted_entries(&path)? {
                if let Some(seed) = read_seed(&file, &environment)? {
                    seeds.push(seed);
                }
            }
        } else if let Some(seed) = read_seed(&path, DEFAULT_ENVIRONMENT)? {
            seeds.push(seed);
        }
    }
    seeds.sort_by(|a, b| {
        (a.environment.as_str(), a.table_name.as_str()).cmp(&(b.environment.as_str(), b.table_name.as_str()))
    });
    Ok(seeds)
}

fn read_seed(path: &Path, environment: &str) -> Result<Option<SeedData>, ManifestError> {
    if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
        return Ok(None);
    }
    let Some(table) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    let content = fs::read_to_string(path).map_err(ManifestError::io(path))?;
    Ok(Some(SeedData::from_sql(environment, table, &content)))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let mut entries = fs::read_dir(dir)
        .map_err(ManifestError::io(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ManifestError::io(dir))?;
    entries.sort();
    Ok(entries)
}

/// Write `manifest` under `root`, creating directories as needed.
///
/// Existing files with other names are left alone.
pub fn write(manifest: &Manifest, root: impl AsRef<Path>) -> Result<(), ManifestError> {
    let root = root.as_ref();
    let migrations_dir = root.join(MIGRATIONS_DIR);
    fs::create_dir_all(&migrations_dir).map_err(ManifestError::io(&migrations_dir))?;

    for migration in &manifest.migrations {
        let path = migrations_dir.join(format!("{}__{}.sql", migration.version, migration.name));
        fs::write(&path, render_migration(migration)).map_err(ManifestError::io(&path))?;
    }

    let mut by_environment: BTreeMap<&str, Vec<&SeedData>> = BTreeMap::new();
    for seed in &manifest.seed_data {
        by_environment.entry(seed.environment.as_str()).or_default().push(seed);
    }
    for (environment, seeds) in by_environment {
        let dir = root.join(SEEDS_DIR).join(environment);
        fs::create_dir_all(&dir).map_err(ManifestError::io(&dir))?;
        for seed in seeds {
            let path = dir.join(format!("{}.sql", seed.table_name));
            fs::write(&path, seed.canonical_sql()).map_err(ManifestError::io(&path))?;
        }
    }

    let file = MetadataFile {
        version: Some(manifest.version.clone()),
        description: Some(manifest.description.clone()),
        author: Some(manifest.author.clone()),
        created_at: Some(manifest.created_at),
        metadata: manifest.metadata.clone(),
    };
    let path = root.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(&file).map_err(|e| ManifestError::MalformedMetadata {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&path, json).map_err(ManifestError::io(&path))?;

    log::info!("Wrote manifest {} to {}", manifest.version, root.display());
    Ok(())
}

fn render_migration(migration: &Migration) -> String {
    let mut out = String::new();
    if !migration.description.is_empty() {
        out.push_str(&format!("{} {}\n", DESCRIPTION_HEADER, migration.description));
    }
    if !migration.dependencies.is_empty() {
        let deps: Vec<String> = migration.dependencies.iter().map(|d| d.to_string()).collect();
        out.push_str(&format!("{} {}\n", DEPENDS_HEADER, deps.join(", ")));
    }
    out.push_str(UP_MARKER);
    out.push('\n');
    out.push_str(migration.up_sql.trim());
    out.push_str("\n\n");
    out.push_str(DOWN_MARKER);
    out.push('\n');
    if let Some(down) = &migration.down_sql {
        out.push_str(down.trim());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_with_headers() {
        let sections = split_sections(
            "-- description: Create users\n-- depends-on: V001, V002\n-- UP\nCREATE TABLE users (id INT);\n\n-- DOWN\nDROP TABLE users;\n",
        )
        .unwrap();
        assert_eq!(sections.description, "Create users");
        assert_eq!(sections.dependencies.len(), 2);
        assert_eq!(sections.up, "CREATE TABLE users (id INT);");
        assert_eq!(sections.down.as_deref(), Some("DROP TABLE users;"));
    }

    #[test]
    fn test_down_marker_must_be_whole_line() {
        let sections = split_sections("CREATE TABLE t (note TEXT DEFAULT '-- DOWN here');\n").unwrap();
        assert!(sections.up.contains("-- DOWN here"));
        assert!(sections.down.is_none());
    }

    #[test]
    fn test_missing_or_blank_down_section() {
        assert!(split_sections("-- UP\nSELECT 1;\n-- DOWN\n\n").unwrap().down.is_none());
        assert!(split_sections("SELECT 1;").unwrap().down.is_none());
    }

    #[test]
    fn test_bad_dependency_is_rejected() {
        assert!(split_sections("-- depends-on: later\n-- UP\nSELECT 1;").is_err());
    }

    #[test]
    fn test_migration_file_pattern() {
        assert!(MIGRATION_FILE.is_match("V001__create_users.sql"));
        assert!(!MIGRATION_FILE.is_match("001_create_users.sql"));
        assert!(!MIGRATION_FILE.is_match("V001__create_users.txt"));
        assert!(!MIGRATION_FILE.is_match("README.md"));
    }
}
