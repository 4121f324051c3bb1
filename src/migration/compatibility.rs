//! Runtime compatibility checks against a migration's declared bounds.
//!
//! Order of checks: below minimum, above maximum, then the major-version gap
//! heuristic. The gap tier is advisory: it sets `status = warning` but keeps
//! `is_compatible = true`, and nothing treats it as blocking.

use crate::migration::{Migration, MigrationRecord, PendingMigration};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityLevel {
    Compatible,
    Warning,
    Incompatible,
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompatibilityLevel::Compatible => "compatible",
            CompatibilityLevel::Warning => "warning",
            CompatibilityLevel::Incompatible => "incompatible",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityStatus {
    pub is_compatible: bool,
    pub status: CompatibilityLevel,
    /// Version of the migration that was checked
    pub current_db_version: String,
    /// The migration's minimum runtime, if it declares one
    pub required_version: Option<String>,
    pub message: String,
}

/// Check `runtime` against `migration`'s runtime bounds.
pub fn check_compatibility(migration: &Migration, runtime: &semver::Version) -> CompatibilityStatus {
    let status = |level: CompatibilityLevel, message: String| CompatibilityStatus {
        is_compatible: level != CompatibilityLevel::Incompatible,
        status: level,
        current_db_version: migration.version.to_string(),
        required_version: migration.min_runtime_version.as_ref().map(|v| v.to_string()),
        message,
    };

    if let Some(min) = &migration.min_runtime_version {
        if runtime < min {
            return status(
                CompatibilityLevel::Incompatible,
                format!("Runtime version {runtime} is below minimum required {min}"),
            );
        }
    }
    if let Some(max) = &migration.max_runtime_version {
        if runtime > max {
            return status(
                CompatibilityLevel::Incompatible,
                format!("Runtime version {runtime} exceeds maximum allowed {max}"),
            );
        }
    }
    if let Some(min) = &migration.min_runtime_version {
        if runtime.major > min.major {
            return status(
                CompatibilityLevel::Warning,
                format!(
                    "Runtime major version {} is newer than migration minimum {}; verify compatibility",
                    runtime.major, min
                ),
            );
        }
    }
    status(
        CompatibilityLevel::Compatible,
        "Migration is compatible with current runtime version".to_string(),
    )
}

/// Compatibility of a whole target database with one runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityMatrix {
    pub runtime_version: String,
    pub current_db_version: Option<String>,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub overall_status: CompatibilityLevel,
}
