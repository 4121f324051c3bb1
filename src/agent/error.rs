//! Agent error type and its mapping to HTTP statuses

use crate::connection::ConnectionError;
use crate::executor::DbError;
use crate::inspector::InspectorError;
use crate::manifest::ManifestError;
use crate::migration::MigrationError;
use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    /// Malformed body or missing field
    InvalidRequest(String),
    /// Missing, unknown, inactive or expired credentials
    Unauthenticated(String),
    RateLimited { client_id: String },
    /// No active database registered under this name
    DatabaseNotFound(String),
    NotFound(String),
    Manifest(ManifestError),
    Migration(MigrationError),
    Inspector(InspectorError),
    Connection(ConnectionError),
    Database(DbError),
    Internal(String),
}

impl AgentError {
    pub fn status_code(&self) -> u16 {
        match self {
            AgentError::InvalidRequest(_) | AgentError::Manifest(_) => 400,
            AgentError::Unauthenticated(_) => 401,
            AgentError::DatabaseNotFound(_) | AgentError::NotFound(_) => 404,
            AgentError::RateLimited { .. } => 429,
            AgentError::Migration(_)
            | AgentError::Inspector(_)
            | AgentError::Connection(_)
            | AgentError::Database(_)
            | AgentError::Internal(_) => 500,
        }
    }

    /// Machine-readable kind, the `error` field of an error body
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::Unauthenticated(_) => "unauthenticated",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::DatabaseNotFound(_) => "database_not_found",
            AgentError::NotFound(_) => "not_found",
            AgentError::Manifest(_) => "invalid_manifest",
            AgentError::Migration(MigrationError::ChecksumMismatch { .. }) => "checksum_mismatch",
            AgentError::Migration(MigrationError::IncompatibleRuntime { .. }) => "incompatible_runtime",
            AgentError::Migration(MigrationError::UnsatisfiedDependency { .. }) => "unsatisfied_dependency",
            AgentError::Migration(MigrationError::LockTimeout(_)) => "lock_timeout",
            AgentError::Migration(_) => "migration_failed",
            AgentError::Inspector(_) => "inspection_failed",
            AgentError::Connection(_) => "connection_failed",
            AgentError::Database(DbError::Timeout(_)) => "timeout",
            AgentError::Database(_) => "database_error",
            AgentError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            AgentError::Unauthenticated(msg) => write!(f, "Authentication failed: {}", msg),
            AgentError::RateLimited { client_id } => write!(f, "Rate limit exceeded for client {}", client_id),
            AgentError::DatabaseNotFound(name) => write!(f, "Database not found: {}", name),
            AgentError::NotFound(path) => write!(f, "No such operation: {}", path),
            AgentError::Manifest(e) => write!(f, "{}", e),
            AgentError::Migration(e) => write!(f, "{}", e),
            AgentError::Inspector(e) => write!(f, "{}", e),
            AgentError::Connection(e) => write!(f, "Failed to connect to database: {}", e),
            AgentError::Database(e) => write!(f, "{}", e),
            AgentError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Manifest(e) => Some(e),
            AgentError::Migration(e) => Some(e),
            AgentError::Inspector(e) => Some(e),
            AgentError::Connection(e) => Some(e),
            AgentError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ManifestError> for AgentError {
    fn from(error: ManifestError) -> Self {
        AgentError::Manifest(error)
    }
}

impl From<MigrationError> for AgentError {
    fn from(error: MigrationError) -> Self {
        AgentError::Migration(error)
    }
}

impl From<InspectorError> for AgentError {
    fn from(error: InspectorError) -> Self {
        AgentError::Inspector(error)
    }
}

impl From<ConnectionError> for AgentError {
    fn from(error: ConnectionError) -> Self {
        AgentError::Connection(error)
    }
}

impl From<DbError> for AgentError {
    fn from(error: DbError) -> Self {
        AgentError::Database(error)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(error: serde_json::Error) -> Self {
        AgentError::InvalidRequest(error.to_string())
    }
}
