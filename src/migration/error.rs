//! Migration-specific error types

use crate::executor::DbError;
use crate::migration::{MigrationVersion, VersionParseError};
use std::fmt;
use std::path::PathBuf;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// A registry entry could not be loaded; the whole load fails
    MalformedMetadata { path: PathBuf, reason: String },
    /// A version or runtime version string did not parse
    InvalidVersion(VersionParseError),
    /// The version is not part of the migration set
    UnknownVersion(MigrationVersion),
    /// A dependency of `version` has not been applied
    UnsatisfiedDependency {
        version: MigrationVersion,
        dependency: MigrationVersion,
    },
    /// The runtime falls outside the migration's declared bounds
    IncompatibleRuntime {
        version: MigrationVersion,
        runtime: String,
        message: String,
    },
    /// An applied migration's content no longer matches what was recorded
    ChecksumMismatch {
        version: MigrationVersion,
        name: String,
        stored: String,
        current: String,
    },
    /// A rollback step cannot run
    RollbackUnavailable {
        version: MigrationVersion,
        reason: String,
    },
    /// A migration statement failed; its transaction was rolled back
    ExecutionFailed {
        version: MigrationVersion,
        name: String,
        statement: Option<String>,
        source: DbError,
    },
    /// Migration lock timeout
    LockTimeout(String),
    /// Bookkeeping query failed
    Database { operation: &'static str, source: DbError },
    /// Filesystem error while reading or writing migrations
    Io { path: PathBuf, source: std::io::Error },
}

impl MigrationError {
    pub(crate) fn database(operation: &'static str) -> impl FnOnce(DbError) -> Self {
        move |source| MigrationError::Database { operation, source }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| MigrationError::Io { path, source }
    }

    /// Whether this failure came from a cancelled (timed out) statement.
    pub fn is_timeout(&self) -> bool {
        match self {
            MigrationError::ExecutionFailed { source, .. } | MigrationError::Database { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::MalformedMetadata { path, reason } => {
                write!(f, "Malformed migration metadata in {}: {}", path.display(), reason)
            }
            MigrationError::InvalidVersion(e) => write!(f, "{e}"),
            MigrationError::UnknownVersion(v) => write!(f, "Unknown migration version {v}"),
            MigrationError::UnsatisfiedDependency { version, dependency } => {
                write!(
                    f,
                    "Migration {} depends on {}, which has not been applied",
                    version, dependency
                )
            }
            MigrationError::IncompatibleRuntime { version, runtime, message } => {
                write!(
                    f,
                    "Migration {} is incompatible with runtime {}: {}",
                    version, runtime, message
                )
            }
            MigrationError::ChecksumMismatch {
                version,
                name,
                stored,
                current,
            } => {
                write!(
                    f,
                    "Migration '{}' (version {}) has been modified after being applied.\n\
                     Stored checksum: {}\n\
                     Current checksum: {}",
                    name, version, stored, current
                )
            }
            MigrationError::RollbackUnavailable { version, reason } => {
                write!(f, "Cannot roll back migration {}: {}", version, reason)
            }
            MigrationError::ExecutionFailed {
                version,
                name,
                statement,
                source,
            } => {
                write!(f, "Migration '{}' (version {}) failed: {}", name, version, source)?;
                if let Some(statement) = statement {
                    write!(f, "\nFailing statement: {}", statement)?;
                }
                Ok(())
            }
            MigrationError::LockTimeout(msg) => write!(f, "Migration lock timeout: {}", msg),
            MigrationError::Database { operation, source } => {
                write!(f, "Failed to {}: {}", operation, source)
            }
            MigrationError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::InvalidVersion(e) => Some(e),
            MigrationError::ExecutionFailed { source, .. } | MigrationError::Database { source, .. } => {
                Some(source)
            }
            MigrationError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<VersionParseError> for MigrationError {
    fn from(error: VersionParseError) -> Self {
        MigrationError::InvalidVersion(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_failure_reports_statement() {
        let err = MigrationError::ExecutionFailed {
            version: MigrationVersion::parse("1.0.0").unwrap(),
            name: "init".into(),
            statement: Some("CREATE TABLE broken (".into()),
            source: DbError::Other("syntax error".into()),
        };
        let text = err.to_string();
        assert!(text.contains("'init' (version 1.0.0) failed"));
        assert!(text.contains("Failing statement: CREATE TABLE broken ("));
    }

    #[test]
    fn test_timeout_detection_uses_classified_error() {
        let err = MigrationError::Database {
            operation: "read migration history",
            source: DbError::Timeout("canceling statement due to statement timeout".into()),
        };
        assert!(err.is_timeout());
        assert!(!MigrationError::LockTimeout("busy".into()).is_timeout());
    }
}
