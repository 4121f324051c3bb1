//! Portable database manifests
//!
//! A [`Manifest`] bundles ordered migrations, per-environment seed data and
//! metadata. It owns no connection: the agent compares, deploys or
//! downloads it, and [`codec`] reads and writes its directory form:
//!
//! ```text
//! <root>/metadata.json
//! <root>/migrations/V<seq>__<name>.sql
//! <root>/seeds/<environment>/<table>.sql
//! ```

pub mod codec;
pub mod error;

pub use codec::{parse, write};
pub use error::ManifestError;

use crate::migration::{checksum, Migration, MigrationSet, MigrationVersion};
use crate::sql::split_normalized;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Manifest-level bounds, tags and free-form properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runtime_version: Option<semver::Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_version: Option<semver::Version>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

/// Seed rows for one table in one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedData {
    pub environment: String,
    pub table_name: String,
    pub statements: Vec<String>,
    pub checksum: String,
}

impl SeedData {
    /// Build seed data from raw SQL, normalizing its statements.
    pub fn from_sql(environment: impl Into<String>, table_name: impl Into<String>, sql: &str) -> Self {
        Self::new(environment, table_name, split_normalized(sql))
    }

    pub fn new(environment: impl Into<String>, table_name: impl Into<String>, statements: Vec<String>) -> Self {
        let mut seed = Self {
            environment: environment.into(),
            table_name: table_name.into(),
            statements,
            checksum: String::new(),
        };
        seed.checksum = checksum(seed.canonical_sql());
        seed
    }

    /// Statements joined by `;\n` with a trailing `;`, the on-disk form.
    pub fn canonical_sql(&self) -> String {
        format!("{};", self.statements.join(";\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub description: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    /// Ascending by version
    #[serde(default)]
    pub migrations: Vec<Migration>,
    #[serde(default)]
    pub seed_data: Vec<SeedData>,
    #[serde(default)]
    pub metadata: ManifestMetadata,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            description: "Database Manifest".to_string(),
            author: "system".to_string(),
            created_at: Utc::now(),
            migrations: Vec::new(),
            seed_data: Vec::new(),
            metadata: ManifestMetadata::default(),
        }
    }
}

impl Manifest {
    /// SHA-256 over the manifest version and every migration and seed
    /// checksum, in order.
    pub fn checksum(&self) -> String {
        let parts: Vec<&str> = std::iter::once(self.version.as_str())
            .chain(self.migrations.iter().map(|m| m.checksum.as_str()))
            .chain(self.seed_data.iter().map(|s| s.checksum.as_str()))
            .collect();
        checksum(parts.join("|"))
    }

    pub fn latest_version(&self) -> Option<&MigrationVersion> {
        self.migrations.iter().map(|m| &m.version).max()
    }

    pub fn seeds_for<'a>(&'a self, environment: &'a str) -> impl Iterator<Item = &'a SeedData> + 'a {
        self.seed_data.iter().filter(move |s| s.environment == environment)
    }

    /// The migrations as an engine input. Migrations without runtime bounds
    /// inherit the manifest's.
    pub fn migration_set(&self) -> MigrationSet {
        self.migrations
            .iter()
            .cloned()
            .map(|mut m| {
                if m.min_runtime_version.is_none() && m.max_runtime_version.is_none() {
                    m.min_runtime_version = self.metadata.min_runtime_version.clone();
                    m.max_runtime_version = self.metadata.max_runtime_version.clone();
                }
                m
            })
            .collect()
    }

    /// Check the manifest for consistency, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut problems = Vec::new();

        if self.version.trim().is_empty() {
            problems.push("manifest version is required".to_string());
        }
        if let (Some(min), Some(max)) = (&self.metadata.min_runtime_version, &self.metadata.max_runtime_version) {
            if min > max {
                problems.push(format!("min_runtime_version {min} is greater than max_runtime_version {max}"));
            }
        }

        let mut seen = BTreeSet::new();
        for migration in &self.migrations {
            let label = format!("migration {}", migration.version);
            if !seen.insert(&migration.version) {
                problems.push(format!("duplicate migration version: {}", migration.version));
            }
            if migration.name.trim().is_empty() {
                problems.push(format!("{label}: name is required"));
            } else if migration.name.contains(['/', '\\']) {
                problems.push(format!("{label}: name must not contain path separators"));
            }
            if migration.up_sql.trim().is_empty() {
                problems.push(format!("{label}: UP SQL is required"));
            }
            if migration.checksum.is_empty() {
                problems.push(format!("{label}: checksum is required"));
            } else if migration.checksum != migration.current_checksum() {
                problems.push(format!("{label}: checksum does not match its UP SQL"));
            }
        }

        for seed in &self.seed_data {
            let label = format!("seed data for table '{}'", seed.table_name);
            if seed.table_name.trim().is_empty() {
                problems.push("seed data: table name is required".to_string());
            }
            if seed.environment.trim().is_empty() {
                problems.push(format!("{label}: environment is required"));
            }
            if seed.statements.is_empty() {
                problems.push(format!("{label}: at least one SQL statement is required"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid(problems))
        }
    }
}
