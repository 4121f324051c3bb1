//! The versioned migration model shared by the registry and manifest layouts

use crate::migration::checksum::checksum;
use crate::migration::MigrationVersion;
use crate::sql::split_statements;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, versioned schema change with optional reverse SQL
///
/// `checksum` is the SHA-256 of `up_sql` and is what the history table
/// stores at apply time. It does not depend on the on-disk layout the
/// migration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub version: MigrationVersion,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub up_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<MigrationVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runtime_version: Option<semver::Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_version: Option<semver::Version>,
    pub checksum: String,
}

impl Migration {
    pub fn new(version: MigrationVersion, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        let up_sql = up_sql.into();
        Self {
            version,
            name: name.into(),
            description: String::new(),
            checksum: checksum(&up_sql),
            up_sql,
            down_sql: None,
            dependencies: Vec::new(),
            min_runtime_version: None,
            max_runtime_version: None,
        }
    }

    /// Attach reverse SQL. Text without any statement (blank or only
    /// comments) means "not reversible".
    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        let down_sql = down_sql.into();
        self.down_sql = (!split_statements(&down_sql).is_empty()).then_some(down_sql);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<MigrationVersion>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_runtime_bounds(
        mut self,
        min: Option<semver::Version>,
        max: Option<semver::Version>,
    ) -> Self {
        self.min_runtime_version = min;
        self.max_runtime_version = max;
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }

    /// Checksum recomputed from the current `up_sql`.
    pub fn current_checksum(&self) -> String {
        checksum(&self.up_sql)
    }
}

/// Migrations keyed and ordered by version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: BTreeMap<MigrationVersion, Migration>,
}

impl MigrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a migration, handing back the one it displaced if the version
    /// was already present.
    pub fn insert(&mut self, migration: Migration) -> Option<Migration> {
        self.migrations.insert(migration.version.clone(), migration)
    }

    pub fn get(&self, version: &MigrationVersion) -> Option<&Migration> {
        self.migrations.get(version)
    }

    pub fn contains(&self, version: &MigrationVersion) -> bool {
        self.migrations.contains_key(version)
    }

    /// Ascending by version
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl FromIterator<Migration> for MigrationSet {
    fn from_iter<I: IntoIterator<Item = Migration>>(iter: I) -> Self {
        let mut set = MigrationSet::new();
        for migration in iter {
            set.insert(migration);
        }
        set
    }
}

impl IntoIterator for MigrationSet {
    type Item = Migration;
    type IntoIter = std::collections::btree_map::IntoValues<MigrationVersion, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn test_checksum_tracks_up_sql() {
        let m = Migration::new(v("1.0.0"), "init", "CREATE TABLE a (id INT);");
        assert_eq!(m.checksum, m.current_checksum());

        let mut edited = m.clone();
        edited.up_sql.push_str(" -- edited");
        assert_ne!(edited.checksum, edited.current_checksum());
    }

    #[test]
    fn test_blank_down_sql_is_not_reversible() {
        let m = Migration::new(v("1.0.0"), "init", "SELECT 1").with_down("  \n");
        assert!(!m.is_reversible());
        let m = m.with_down("DROP TABLE a;");
        assert!(m.is_reversible());
    }

    #[test]
    fn test_set_iterates_in_version_order() {
        let set: MigrationSet = ["1.10.0", "1.2.0", "1.0.0"]
            .iter()
            .map(|s| Migration::new(v(s), format!("m{s}"), "SELECT 1"))
            .collect();
        let order: Vec<String> = set.iter().map(|m| m.version.to_string()).collect();
        assert_eq!(order, vec!["1.0.0", "1.2.0", "1.10.0"]);
        assert_eq!(set.latest().unwrap().version, v("1.10.0"));
    }
}
