//! `MigrationRecord` - rows of the `schema_migrations_v2` history table - and
//! the per-run outcome types built while migrating or rolling back.

use crate::executor::{column, DbError};
use crate::migration::MigrationVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Applied,
    Skipped,
    DryRun,
    Failed,
    RolledBack,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Applied => "applied",
            RecordStatus::Skipped => "skipped",
            RecordStatus::DryRun => "dry_run",
            RecordStatus::Failed => "failed",
            RecordStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(RecordStatus::Applied),
            "skipped" => Ok(RecordStatus::Skipped),
            "dry_run" => Ok(RecordStatus::DryRun),
            "failed" => Ok(RecordStatus::Failed),
            "rolled_back" => Ok(RecordStatus::RolledBack),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// One row of the history table
///
/// Only `applied` rows are persisted: a failed apply rolls back its own
/// record, and a successful rollback deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: MigrationVersion,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub runtime_version: Option<String>,
    pub execution_time_ms: i64,
    pub status: RecordStatus,
}

impl MigrationRecord {
    /// Expected column order: `version`, `name`, `checksum`, `applied_at`,
    /// `runtime_version`, `execution_time_ms`, `status`
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let version: String = column(row, 0)?;
        let status: String = column(row, 6)?;
        Ok(Self {
            version: MigrationVersion::parse(&version).map_err(|e| DbError::Parse(e.to_string()))?,
            name: column(row, 1)?,
            checksum: column(row, 2)?,
            applied_at: column(row, 3)?,
            runtime_version: column(row, 4)?,
            execution_time_ms: column::<Option<i64>>(row, 5)?.unwrap_or_default(),
            status: status.parse().map_err(DbError::Parse)?,
        })
    }

    pub fn is_applied(&self) -> bool {
        self.status == RecordStatus::Applied
    }
}

/// What happened to one migration during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub version: MigrationVersion,
    pub name: String,
    pub status: RecordStatus,
    pub checksum: String,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accumulated result of a migrate or rollback run
///
/// When a run aborts, the report still holds every outcome recorded before
/// the failure; migrations committed up to that point stay committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub outcomes: Vec<MigrationOutcome>,
    pub warnings: Vec<String>,
}

impl MigrationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, outcome: MigrationOutcome) {
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_migration(outcome.status.as_str());
        self.outcomes.push(outcome);
    }

    pub(crate) fn warn(&mut self, warning: String) {
        log::warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Migrations whose state actually changed (applied or rolled back).
    pub fn changes(&self) -> usize {
        self.count(RecordStatus::Applied) + self.count(RecordStatus::RolledBack)
    }

    pub fn versions(&self, status: RecordStatus) -> Vec<MigrationVersion> {
        self.outcomes
            .iter()
            .filter(|o| o.status == status)
            .map(|o| o.version.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            RecordStatus::Applied,
            RecordStatus::Skipped,
            RecordStatus::DryRun,
            RecordStatus::Failed,
            RecordStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("pending".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_report_counts_changes() {
        let mut report = MigrationReport::new(false);
        for (v, status) in [("1.0.0", RecordStatus::Applied), ("1.1.0", RecordStatus::Skipped)] {
            report.push(MigrationOutcome {
                version: MigrationVersion::parse(v).unwrap(),
                name: v.into(),
                status,
                checksum: String::new(),
                execution_time_ms: 0,
                error: None,
            });
        }
        assert_eq!(report.changes(), 1);
        assert_eq!(report.versions(RecordStatus::Skipped).len(), 1);
    }
}
