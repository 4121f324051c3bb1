//! Metadata store: registered databases, deployment history, audit log and
//! API keys
//!
//! The agent only talks to [`MetadataStore`]; [`PgMetadataStore`] keeps the
//! data in its own PostgreSQL database, separate from every target.

pub mod postgres;
pub mod schema;

pub use postgres::PgMetadataStore;

use crate::executor::DbError;
use crate::migration::{MigrationOutcome, RecordStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Environment assigned to databases registered without one
pub const DEFAULT_DATABASE_ENVIRONMENT: &str = "production";

/// A registered target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub id: Uuid,
    pub name: String,
    /// Never serialized back to clients
    #[serde(skip_serializing, default)]
    pub connection_string: String,
    pub description: Option<String>,
    pub environment: String,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDatabase {
    pub name: String,
    pub connection_string: String,
    pub description: Option<String>,
    /// Defaults to [`DEFAULT_DATABASE_ENVIRONMENT`] when `None`
    pub environment: Option<String>,
    pub created_by: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Applied,
    DryRun,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Applied => "applied",
            DeploymentStatus::DryRun => "dry_run",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "applied" => Ok(DeploymentStatus::Applied),
            "dry_run" => Ok(DeploymentStatus::DryRun),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(format!("unknown deployment status '{other}'")),
        }
    }
}

/// One attempt to apply a manifest version to a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub database_id: Uuid,
    /// Highest migration version the manifest carries
    pub version: String,
    pub manifest_version: String,
    pub status: DeploymentStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    /// Manifest checksum
    pub checksum: String,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub database_id: Uuid,
    pub version: String,
    pub manifest_version: String,
    pub applied_by: Option<String>,
    pub checksum: String,
    pub dry_run: bool,
}

/// One migration's outcome within a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentMigration {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub status: RecordStatus,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl DeploymentMigration {
    pub fn from_outcome(deployment_id: Uuid, outcome: &MigrationOutcome) -> Self {
        let applied_at = matches!(outcome.status, RecordStatus::Applied | RecordStatus::RolledBack).then(Utc::now);
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            version: outcome.version.to_string(),
            name: outcome.name.clone(),
            checksum: outcome.checksum.clone(),
            status: outcome.status,
            execution_time_ms: i64::try_from(outcome.execution_time_ms).unwrap_or(i64::MAX),
            error_message: outcome.error.clone(),
            applied_at,
        }
    }
}

/// A deployment together with its migrations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub deployment: Deployment,
    pub migrations: Vec<DeploymentMigration>,
}

/// One page of deployment history, most recent first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPage {
    pub deployments: Vec<DeploymentEntry>,
    pub total_count: i64,
    pub has_more: bool,
}

/// One audited agent call
///
/// The typed fields cover what every call has; anything operation-specific
/// goes into `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub client_id: Option<String>,
    pub database_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub request_id: Option<String>,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub request_size_bytes: i64,
    pub response_size_bytes: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A stored API key. Only the SHA-256 of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Active and not expired at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

/// Persistence used by the agent
///
/// Implementations must be shareable between the coroutines serving
/// concurrent requests.
pub trait MetadataStore: Send + Sync {
    /// Create every metadata table that does not exist yet.
    fn initialize(&self) -> Result<(), DbError>;

    fn register_database(&self, database: &NewDatabase) -> Result<Database, DbError>;

    fn find_database(&self, name: &str) -> Result<Option<Database>, DbError>;

    fn list_databases(&self) -> Result<Vec<Database>, DbError>;

    /// Insert a deployment in `pending` state.
    fn create_deployment(&self, deployment: &NewDeployment) -> Result<Deployment, DbError>;

    /// Move a deployment to its final state and stamp `applied_at`.
    fn finish_deployment(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        execution_time_ms: i64,
        error_message: Option<&str>,
    ) -> Result<(), DbError>;

    fn record_migration(&self, migration: &DeploymentMigration) -> Result<(), DbError>;

    /// Deployments of `database`, ordered by `applied_at DESC NULLS LAST,
    /// created_at DESC`.
    fn deployment_history(&self, database: &str, limit: i64, offset: i64) -> Result<DeploymentPage, DbError>;

    fn log_audit(&self, entry: &AuditEntry) -> Result<(), DbError>;

    /// Store a key, replacing any earlier key of the same client.
    fn register_api_key(&self, key: &ApiKey) -> Result<(), DbError>;

    fn find_api_key(&self, key_id: &str) -> Result<Option<ApiKey>, DbError>;

    /// Bump `usage_count` and `last_used_at`.
    fn touch_api_key(&self, key_id: &str) -> Result<(), DbError>;

    /// Deactivate a key. Returns whether it existed.
    fn revoke_api_key(&self, key_id: &str) -> Result<bool, DbError>;

    fn list_api_keys(&self) -> Result<Vec<ApiKey>, DbError>;
}
