//! Migration status tracking

use crate::migration::{Migration, MigrationRecord, MigrationVersion};
use serde::{Deserialize, Serialize};

/// Migration status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Applied migrations (from the history table), ascending by version
    pub applied: Vec<MigrationRecord>,

    /// Pending migrations (in the set, not yet applied)
    pub pending: Vec<PendingMigration>,

    /// Versions recorded as applied that the migration set does not contain
    pub unknown: Vec<MigrationVersion>,
}

/// Represents a pending migration (not yet applied)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub version: MigrationVersion,
    pub name: String,
    pub checksum: String,
    pub dependencies: Vec<MigrationVersion>,
}

impl From<&Migration> for PendingMigration {
    fn from(migration: &Migration) -> Self {
        Self {
            version: migration.version.clone(),
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            dependencies: migration.dependencies.clone(),
        }
    }
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest applied version
    pub fn current_version(&self) -> Option<&MigrationVersion> {
        self.applied.iter().map(|r| &r.version).max()
    }

    /// `pending_migrations`, `up_to_date` or `no_migrations`
    pub fn summary(&self) -> &'static str {
        if !self.pending.is_empty() {
            "pending_migrations"
        } else if self.applied.is_empty() {
            "no_migrations"
        } else {
            "up_to_date"
        }
    }
}

/// Process exit codes shared by the CLI and health checks
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const PENDING: i32 = 1;
    pub const INCOMPATIBLE: i32 = 2;
    pub const AUTHENTICATION: i32 = 3;
}

/// Result of a migration health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub exit_code: i32,
    pub message: String,
}

impl HealthCheck {
    pub fn is_healthy(&self) -> bool {
        self.exit_code == exit_code::OK
    }
}
