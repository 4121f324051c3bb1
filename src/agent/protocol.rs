//! Request and response bodies of the agent's JSON API

use crate::inspector::SchemaComparison;
use crate::manifest::Manifest;
use crate::metadb::{DeploymentPage, DeploymentStatus};
use crate::migration::{MigrationOutcome, MigrationVersion};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 1000;

/// The RPC operations, one per `POST /v1/<name>` route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ping,
    Compare,
    Download,
    Deploy,
    Bootstrap,
    History,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Ping,
        Action::Compare,
        Action::Download,
        Action::Deploy,
        Action::Bootstrap,
        Action::History,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::Compare => "compare",
            Action::Download => "download",
            Action::Deploy => "deploy",
            Action::Bootstrap => "bootstrap",
            Action::History => "history",
        }
    }

    pub fn path(self) -> String {
        format!("/v1/{}", self.as_str())
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.split('?').next()?.strip_prefix("/v1/")?;
        Action::ALL.into_iter().find(|a| a.as_str() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub agent_version: String,
    pub status: String,
    /// Unix seconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub database: String,
    pub manifest: Manifest,
    #[serde(default)]
    pub include_data_diff: bool,
}

/// An applied migration whose recorded checksum differs from the manifest's
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMismatch {
    pub version: MigrationVersion,
    pub stored: String,
    pub current: String,
}

/// Live row count of a seeded table against its seed statement count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDifference {
    pub table: String,
    pub environment: String,
    pub expected_rows: i64,
    pub actual_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareResponse {
    pub is_identical: bool,
    pub comparison: SchemaComparison,
    /// Manifest migrations not yet applied on the target
    pub pending_migrations: Vec<MigrationVersion>,
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    #[serde(default)]
    pub data_differences: Vec<DataDifference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub database: String,
    #[serde(default)]
    pub include_data: bool,
    /// Seed environment for exported rows; the database's own when unset
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub manifest: Manifest,
    pub checksum: String,
    pub objects_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub database: String,
    pub manifest: Manifest,
    #[serde(default)]
    pub dry_run: bool,
    /// Stop after this version
    #[serde(default)]
    pub target_version: Option<MigrationVersion>,
    /// Deploy even when a migration's runtime bounds exclude `runtime_version`
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub runtime_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub deployment_id: Uuid,
    pub status: DeploymentStatus,
    pub results: Vec<MigrationOutcome>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub execution_time_ms: i64,
}

impl DeployResponse {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub database: String,
    pub connection_string: String,
    pub manifest: Manifest,
    #[serde(default)]
    pub create_database: bool,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub database_id: Uuid,
    /// The database was not registered before this call
    pub registered: bool,
    /// `CREATE DATABASE` ran
    pub created_database: bool,
    pub deployment: DeployResponse,
    pub seeds_applied: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub database: String,
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_history_limit() -> i64 {
    DEFAULT_HISTORY_LIMIT
}

pub type HistoryResponse = DeploymentPage;

/// Body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(Action::from_path("/v1/deploy"), Some(Action::Deploy));
        assert_eq!(Action::from_path("/v1/history?x=1"), Some(Action::History));
        assert_eq!(Action::from_path("/v2/deploy"), None);
        assert_eq!(Action::from_path("/v1/drop"), None);
        for action in Action::ALL {
            assert_eq!(Action::from_path(&action.path()), Some(action));
        }
    }

    #[test]
    fn test_history_request_defaults() {
        let req: HistoryRequest = serde_json::from_str(r#"{"database":"orders"}"#).unwrap();
        assert_eq!(req.limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(req.offset, 0);
    }

    #[test]
    fn test_deploy_request_defaults() {
        let manifest = serde_json::to_value(Manifest::default()).unwrap();
        let req: DeployRequest =
            serde_json::from_value(serde_json::json!({"database": "orders", "manifest": manifest})).unwrap();
        assert!(!req.dry_run);
        assert!(!req.force);
        assert!(req.target_version.is_none());
    }
}
