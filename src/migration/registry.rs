//! Migration registry loaded from the self-migration directory layout
//!
//! ```text
//! <root>/<semver>/metadata.json   # version, name, description, bounds, dependencies
//! <root>/<semver>/up.sql
//! <root>/<semver>/down.sql        # optional
//! ```
//!
//! The registry is an owned value; callers load it once and hand it (or the
//! [`MigrationSet`] inside it) to a [`Migrator`](crate::migration::Migrator).

use crate::migration::{
    check_compatibility, CompatibilityStatus, Migration, MigrationError, MigrationSet,
    MigrationVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";
pub const UP_FILE: &str = "up.sql";
pub const DOWN_FILE: &str = "down.sql";

#[derive(Debug, Serialize, Deserialize)]
struct RegistryMetadata {
    #[serde(default)]
    version: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_runtime_version: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    root: PathBuf,
    migrations: MigrationSet,
}

impl MigrationRegistry {
    /// Load every `<root>/<version>/` entry.
    ///
    /// A missing root yields an empty registry and directories without a
    /// `metadata.json` are skipped. Anything malformed fails the whole load.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let root = root.as_ref().to_path_buf();
        let mut migrations = MigrationSet::new();

        if !root.exists() {
            log::debug!("Migration registry {} does not exist; treating as empty", root.display());
            return Ok(Self { root, migrations });
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&root)
            .map_err(MigrationError::io(&root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let metadata_path = dir.join(METADATA_FILE);
            if !metadata_path.exists() {
                log::debug!("Skipping {}: no {}", dir.display(), METADATA_FILE);
                continue;
            }
            let migration = load_entry(&dir, &metadata_path)?;
            let version = migration.version.clone();
            if migrations.insert(migration).is_some() {
                return Err(MigrationError::MalformedMetadata {
                    path: metadata_path,
                    reason: format!("duplicate migration version {version}"),
                });
            }
        }

        log::debug!("Loaded {} migration(s) from {}", migrations.len(), root.display());
        Ok(Self { root, migrations })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    pub fn into_set(self) -> MigrationSet {
        self.migrations
    }

    /// Ascending by version
    pub fn sorted(&self) -> Vec<&Migration> {
        self.migrations.iter().collect()
    }

    pub fn get(&self, version: &MigrationVersion) -> Option<&Migration> {
        self.migrations.get(version)
    }

    /// Fail with `UnsatisfiedDependency` if any dependency of `version` is
    /// missing from `applied`.
    pub fn validate_dependencies(
        &self,
        version: &MigrationVersion,
        applied: &BTreeSet<MigrationVersion>,
    ) -> Result<(), MigrationError> {
        let migration = self
            .get(version)
            .ok_or_else(|| MigrationError::UnknownVersion(version.clone()))?;
        validate_dependencies(migration, applied)
    }

    pub fn check_compatibility(
        &self,
        version: &MigrationVersion,
        runtime: &semver::Version,
    ) -> Option<CompatibilityStatus> {
        self.get(version).map(|m| check_compatibility(m, runtime))
    }

    /// Non-fatal problems worth surfacing before a deploy.
    pub fn validate_files(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for migration in self.migrations.iter() {
            if !migration.is_reversible() {
                warnings.push(format!("Migration {} has no down migration", migration.version));
            }
            for dependency in &migration.dependencies {
                if !self.migrations.contains(dependency) {
                    warnings.push(format!(
                        "Migration {} depends on unknown version {}",
                        migration.version, dependency
                    ));
                } else if dependency >= &migration.version {
                    warnings.push(format!(
                        "Migration {} depends on later version {}",
                        migration.version, dependency
                    ));
                }
            }
            if let (Some(min), Some(max)) = (&migration.min_runtime_version, &migration.max_runtime_version) {
                if min > max {
                    warnings.push(format!(
                        "Migration {} declares min runtime {} above max runtime {}",
                        migration.version, min, max
                    ));
                }
            }
        }
        warnings
    }

    /// Create `<root>/<version>/` with template files.
    pub fn scaffold(root: impl AsRef<Path>, version: &str, name: &str) -> Result<PathBuf, MigrationError> {
        let parsed = MigrationVersion::parse_semantic(version)?;
        let dir = root.as_ref().join(parsed.to_string());
        if dir.exists() {
            return Err(MigrationError::MalformedMetadata {
                path: dir,
                reason: "migration directory already exists".to_string(),
            });
        }
        fs::create_dir_all(&dir).map_err(MigrationError::io(&dir))?;

        let metadata = RegistryMetadata {
            version: parsed.to_string(),
            name: name.to_string(),
            description: String::new(),
            min_runtime_version: None,
            max_runtime_version: None,
            dependencies: Vec::new(),
        };
        let json = serde_json::to_string_pretty(&metadata).map_err(|e| MigrationError::MalformedMetadata {
            path: dir.join(METADATA_FILE),
            reason: e.to_string(),
        })?;
        write_file(&dir.join(METADATA_FILE), &format!("{json}\n"))?;
        write_file(&dir.join(UP_FILE), &format!("-- {name}: forward migration\n"))?;
        write_file(&dir.join(DOWN_FILE), &format!("-- {name}: reverse migration\n"))?;
        Ok(dir)
    }
}

pub(crate) fn validate_dependencies(
    migration: &Migration,
    applied: &BTreeSet<MigrationVersion>,
) -> Result<(), MigrationError> {
    match migration.dependencies.iter().find(|dep| !applied.contains(dep)) {
        Some(dependency) => Err(MigrationError::UnsatisfiedDependency {
            version: migration.version.clone(),
            dependency: dependency.clone(),
        }),
        None => Ok(()),
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), MigrationError> {
    fs::write(path, content).map_err(MigrationError::io(path))
}

fn load_entry(dir: &Path, metadata_path: &Path) -> Result<Migration, MigrationError> {
    let malformed = |reason: String| MigrationError::MalformedMetadata {
        path: metadata_path.to_path_buf(),
        reason,
    };

    let raw = fs::read_to_string(metadata_path).map_err(MigrationError::io(metadata_path))?;
    let metadata: RegistryMetadata =
        serde_json::from_str(&raw).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    if metadata.version.trim().is_empty() {
        return Err(malformed("missing required field 'version'".to_string()));
    }
    if metadata.name.trim().is_empty() {
        return Err(malformed("missing required field 'name'".to_string()));
    }
    let version = MigrationVersion::parse_semantic(&metadata.version).map_err(|e| malformed(e.to_string()))?;

    let bound = |field: &str, value: &Option<String>| -> Result<Option<semver::Version>, MigrationError> {
        match value.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => semver::Version::parse(text)
                .map(Some)
                .map_err(|e| malformed(format!("invalid {field} '{text}': {e}"))),
        }
    };
    let min = bound("min_runtime_version", &metadata.min_runtime_version)?;
    let max = bound("max_runtime_version", &metadata.max_runtime_version)?;

    let dependencies = metadata
        .dependencies
        .iter()
        .map(|dep| MigrationVersion::parse_semantic(dep).map_err(|e| malformed(format!("invalid dependency: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;

    let up_path = dir.join(UP_FILE);
    if !up_path.exists() {
        return Err(malformed(format!("missing {}", UP_FILE)));
    }
    let up_sql = fs::read_to_string(&up_path).map_err(MigrationError::io(&up_path))?;

    let down_path = dir.join(DOWN_FILE);
    let down_sql = if down_path.exists() {
        fs::read_to_string(&down_path).map_err(MigrationError::io(&down_path))?
    } else {
        String::new()
    };

    Ok(Migration::new(version, metadata.name, up_sql)
        .with_description(metadata.description)
        .with_down(down_sql)
        .with_dependencies(dependencies)
        .with_runtime_bounds(min, max))
}
