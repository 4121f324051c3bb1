//! The agent's six operations and the pipeline every call goes through

use super::audit::{self, AuditDetails, CallContext};
use super::auth;
use super::protocol::*;
use super::rate_limit::RateLimiter;
use super::target::{in_session, physical_name, TargetConnector};
use super::{AgentError, AGENT_VERSION};
use crate::connection::validate_connection_string;
use crate::inspector::{compare, creation_order, export_seed_data, reverse_engineer};
use crate::manifest::SeedData;
use crate::metadb::{Database, DeploymentMigration, DeploymentStatus, MetadataStore, NewDatabase, NewDeployment};
use crate::migration::{
    checksums_match, parse_runtime_version, MigrateOptions, MigrationLockGuard, MigrationReport, Migrator,
    RecordStatus,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag given to databases registered by a bootstrap call
pub const BOOTSTRAP_TAG: &str = "bootstrap";

#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    /// Deadline for each statement run on a target
    pub statement_timeout: Option<Duration>,
    /// How long a deployment waits for another one on the same target
    pub lock_timeout: Option<Duration>,
}

/// Status and JSON body of a finished call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    fn json<T: Serialize>(value: &T) -> Result<Self, AgentError> {
        let body = serde_json::to_vec(value).map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(Self { status: 200, body })
    }

    pub fn error(error: &AgentError) -> Self {
        let body = ErrorBody {
            error: error.kind().to_string(),
            message: error.to_string(),
        };
        Self {
            status: error.status_code(),
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, AgentError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_slice(b"{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

pub struct Agent {
    store: Arc<dyn MetadataStore>,
    targets: Arc<dyn TargetConnector>,
    limiter: RateLimiter,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        targets: Arc<dyn TargetConnector>,
        limiter: RateLimiter,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            targets,
            limiter,
            settings,
        }
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    /// Authenticate, rate-limit, dispatch and audit one call.
    ///
    /// `call.client_id` holds the claimed client id on entry; it is only
    /// trusted once the key has been checked.
    pub fn call(&self, call: &mut CallContext, api_key: Option<&str>, body: &[u8]) -> Reply {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "agent.call",
            action = call.action.as_str(),
            request_id = %call.request_id
        )
        .entered();

        let mut details = AuditDetails::default();
        let claimed = call.client_id.take();
        let result = auth::authenticate(self.store.as_ref(), claimed.as_deref(), api_key, Utc::now())
            .and_then(|client_id| {
                call.client_id = Some(client_id.clone());
                if self.limiter.allow(&client_id) {
                    Ok(client_id)
                } else {
                    Err(AgentError::RateLimited { client_id })
                }
            })
            .and_then(|client_id| self.dispatch(call.action, body, &client_id, &mut details));

        let (reply, error_message) = match result {
            Ok(reply) => (reply, None),
            Err(e) => {
                if e.status_code() >= 500 {
                    log::error!("{} failed (request {}): {}", call.action.as_str(), call.request_id, e);
                } else {
                    log::warn!("{} rejected (request {}): {}", call.action.as_str(), call.request_id, e);
                }
                (Reply::error(&e), Some(e.to_string()))
            }
        };
        if call.client_id.is_none() {
            call.client_id = claimed;
        }

        audit::record(
            self.store.as_ref(),
            call,
            &details,
            reply.status,
            error_message.as_deref(),
            reply.body.len(),
        );

        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_rpc(
            call.action.as_str(),
            if reply.status == 200 { "ok" } else { "error" },
            call.started.elapsed(),
        );

        reply
    }

    fn dispatch(
        &self,
        action: Action,
        body: &[u8],
        client_id: &str,
        details: &mut AuditDetails,
    ) -> Result<Reply, AgentError> {
        match action {
            Action::Ping => Reply::json(&self.ping(&parse_body(body)?, details)),
            Action::Compare => Reply::json(&self.compare(&parse_body(body)?, details)?),
            Action::Download => Reply::json(&self.download(&parse_body(body)?, details)?),
            Action::Deploy => Reply::json(&self.deploy(&parse_body(body)?, Some(client_id), details)?),
            Action::Bootstrap => Reply::json(&self.bootstrap(&parse_body(body)?, Some(client_id), details)?),
            Action::History => Reply::json(&self.history(&parse_body(body)?, details)?),
        }
    }

    /// Registered, active database `name`
    fn active_database(&self, name: &str) -> Result<Database, AgentError> {
        match self.store.find_database(name)? {
            Some(database) if database.is_active => Ok(database),
            _ => Err(AgentError::DatabaseNotFound(name.to_string())),
        }
    }

    pub fn ping(&self, req: &PingRequest, details: &mut AuditDetails) -> PingResponse {
        if let Some(version) = &req.client_version {
            details.note("client_version", version.clone());
        }
        PingResponse {
            agent_version: AGENT_VERSION.to_string(),
            status: "healthy".to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Compare a database with the schema its manifest describes.
    pub fn compare(&self, req: &CompareRequest, details: &mut AuditDetails) -> Result<CompareResponse, AgentError> {
        req.manifest.validate()?;
        let database = self.active_database(&req.database)?;
        details.database_id = Some(database.id);
        details.note("include_data_diff", req.include_data_diff);

        let migrations = req.manifest.migration_set();
        let timeout = self.settings.statement_timeout;
        let response = in_session(self.targets.as_ref(), &database, |session| {
            let expected = session.expected_state(&migrations, timeout)?;
            let actual = session.capture(timeout)?;
            let comparison = compare(&expected, &actual);

            let applied = session.history().applied_records()?;
            let applied_versions: BTreeSet<_> = applied.iter().map(|r| &r.version).collect();
            let pending_migrations = migrations
                .iter()
                .filter(|m| !applied_versions.contains(&m.version))
                .map(|m| m.version.clone())
                .collect();
            let checksum_mismatches = applied
                .iter()
                .filter_map(|record| {
                    let migration = migrations.get(&record.version)?;
                    (!checksums_match(&record.checksum, &migration.checksum)).then(|| ChecksumMismatch {
                        version: record.version.clone(),
                        stored: record.checksum.clone(),
                        current: migration.checksum.clone(),
                    })
                })
                .collect();

            let mut data_differences = Vec::new();
            if req.include_data_diff {
                for seed in req.manifest.seeds_for(&database.environment) {
                    let actual_rows = match session.catalog().row_count(&seed.table_name) {
                        Ok(count) => count,
                        Err(e) if e.is_not_initialized() => 0,
                        Err(e) => return Err(e.into()),
                    };
                    let expected_rows = i64::try_from(seed.statements.len()).unwrap_or(i64::MAX);
                    if actual_rows != expected_rows {
                        data_differences.push(DataDifference {
                            table: seed.table_name.clone(),
                            environment: seed.environment.clone(),
                            expected_rows,
                            actual_rows,
                        });
                    }
                }
            }

            Ok(CompareResponse {
                is_identical: comparison.is_identical && data_differences.is_empty(),
                comparison,
                pending_migrations,
                checksum_mismatches,
                data_differences,
            })
        })?;

        details.note("is_identical", response.is_identical);
        Ok(response)
    }

    /// Reverse-engineer a database into a manifest.
    pub fn download(&self, req: &DownloadRequest, details: &mut AuditDetails) -> Result<DownloadResponse, AgentError> {
        let database = self.active_database(&req.database)?;
        details.database_id = Some(database.id);
        let environment = req.environment.clone().unwrap_or_else(|| database.environment.clone());

        let timeout = self.settings.statement_timeout;
        let manifest = in_session(self.targets.as_ref(), &database, |session| {
            let state = session.capture(timeout)?;
            let mut manifest = reverse_engineer(&state)?;
            manifest.description = format!("Schema of database {}", database.name);
            if req.include_data {
                let tables = creation_order(&state.tables)?;
                manifest.seed_data = export_seed_data(session.catalog(), &tables, &environment)?;
            }
            Ok(manifest)
        })?;

        let objects_count = manifest.migrations.len() + manifest.seed_data.len();
        details.note("include_data", req.include_data);
        details.note("environment", environment);
        details.note("objects_count", objects_count);
        Ok(DownloadResponse {
            checksum: manifest.checksum(),
            manifest,
            objects_count,
        })
    }

    /// Apply a manifest to a registered database.
    ///
    /// Once the deployment row exists, failures are reported in the
    /// response (status `failed`) rather than as an error, so the caller
    /// still sees which migrations committed.
    pub fn deploy(
        &self,
        req: &DeployRequest,
        caller: Option<&str>,
        details: &mut AuditDetails,
    ) -> Result<DeployResponse, AgentError> {
        req.manifest.validate()?;
        let database = self.active_database(&req.database)?;
        details.database_id = Some(database.id);
        self.deploy_to(&database, req, caller, details)
    }

    fn deploy_to(
        &self,
        database: &Database,
        req: &DeployRequest,
        caller: Option<&str>,
        details: &mut AuditDetails,
    ) -> Result<DeployResponse, AgentError> {
        let started = Instant::now();
        let runtime_version = req
            .runtime_version
            .as_deref()
            .map(parse_runtime_version)
            .transpose()
            .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;

        let manifest = &req.manifest;
        let deployment = self.store.create_deployment(&NewDeployment {
            database_id: database.id,
            version: manifest
                .latest_version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| manifest.version.clone()),
            manifest_version: manifest.version.clone(),
            applied_by: caller.map(str::to_string),
            checksum: manifest.checksum(),
            dry_run: req.dry_run,
        })?;
        details.deployment_id = Some(deployment.id);

        let migrator = Migrator::new(manifest.migration_set());
        let options = MigrateOptions {
            dry_run: req.dry_run,
            max_version: req.target_version.clone(),
            runtime_version,
            fail_on_incompatible: !req.force,
            statement_timeout: self.settings.statement_timeout,
        };
        let lock_timeout = self.settings.lock_timeout;
        let mut report = MigrationReport::new(req.dry_run);
        let run = in_session(self.targets.as_ref(), database, |session| {
            let history = session.history();
            let _lock = MigrationLockGuard::acquire(history, lock_timeout)?;
            migrator.migrate_into(history, &options, &mut report)?;
            Ok(())
        });

        let mut warnings = report.warnings.clone();
        for outcome in &report.outcomes {
            let row = DeploymentMigration::from_outcome(deployment.id, outcome);
            if let Err(e) = self.store.record_migration(&row) {
                log::warn!("Failed to record migration {} of deployment {}: {}", row.version, deployment.id, e);
                warnings.push(format!("Migration {} was not recorded in the deployment history", row.version));
            }
        }

        let errors: Vec<String> = run.err().map(|e| e.to_string()).into_iter().collect();
        let status = match (errors.is_empty(), req.dry_run) {
            (false, _) => DeploymentStatus::Failed,
            (true, true) => DeploymentStatus::DryRun,
            (true, false) => DeploymentStatus::Applied,
        };
        let execution_time_ms = elapsed_ms(started);
        self.store.finish_deployment(
            deployment.id,
            status,
            execution_time_ms,
            errors.first().map(String::as_str),
        )?;

        match status {
            DeploymentStatus::Failed => log::error!(
                "Deployment {} to {} failed after {}ms",
                deployment.id,
                database.name,
                execution_time_ms
            ),
            _ => log::info!(
                "Deployment {} to {} finished as {} ({} applied, {}ms)",
                deployment.id,
                database.name,
                status,
                report.count(RecordStatus::Applied),
                execution_time_ms
            ),
        }

        details.note("dry_run", req.dry_run);
        details.note("force", req.force);
        details.note("status", status.as_str());
        details.note("migrations", report.outcomes.len());
        if let Some(target) = &req.target_version {
            details.note("target_version", target.to_string());
        }

        Ok(DeployResponse {
            deployment_id: deployment.id,
            status,
            results: report.outcomes,
            warnings,
            errors,
            execution_time_ms,
        })
    }

    /// Register a database if needed, optionally create it, deploy the
    /// manifest and seed it.
    ///
    /// Seeds for the database's environment are applied only when this
    /// call applied at least one migration, so repeating a bootstrap does
    /// not insert the seed rows twice.
    pub fn bootstrap(
        &self,
        req: &BootstrapRequest,
        caller: Option<&str>,
        details: &mut AuditDetails,
    ) -> Result<BootstrapResponse, AgentError> {
        req.manifest.validate()?;
        validate_connection_string(&req.connection_string)
            .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;

        let (database, registered) = match self.store.find_database(&req.database)? {
            Some(database) if database.is_active => (database, false),
            Some(_) => return Err(AgentError::DatabaseNotFound(req.database.clone())),
            None => {
                let database = self.store.register_database(&NewDatabase {
                    name: req.database.clone(),
                    connection_string: req.connection_string.clone(),
                    description: Some(
                        req.description
                            .clone()
                            .unwrap_or_else(|| "Bootstrap database".to_string()),
                    ),
                    environment: req.environment.clone(),
                    created_by: caller.map(str::to_string),
                    tags: vec![BOOTSTRAP_TAG.to_string()],
                })?;
                (database, true)
            }
        };
        details.database_id = Some(database.id);

        let created_database = if req.create_database && !req.dry_run {
            let name = physical_name(&database.connection_string, &database.name);
            let created = self.targets.create_database(&database.connection_string, &name)?;
            if created {
                self.targets.evict(&database.name);
            }
            created
        } else {
            false
        };

        let deploy = DeployRequest {
            database: database.name.clone(),
            manifest: req.manifest.clone(),
            dry_run: req.dry_run,
            target_version: None,
            force: false,
            runtime_version: None,
        };
        let deployment = self.deploy_to(&database, &deploy, caller, details)?;

        let applied_any = deployment.results.iter().any(|o| o.status == RecordStatus::Applied);
        let seeds: Vec<&SeedData> = req.manifest.seeds_for(&database.environment).collect();
        let seeds_applied = if deployment.succeeded() && !req.dry_run && applied_any && !seeds.is_empty() {
            in_session(self.targets.as_ref(), &database, |session| Ok(session.apply_seeds(&seeds)?))?
        } else {
            0
        };

        details.note("create_database", req.create_database);
        details.note("registered", registered);
        details.note("seeds_applied", seeds_applied);
        Ok(BootstrapResponse {
            database_id: database.id,
            registered,
            created_database,
            deployment,
            seeds_applied,
        })
    }

    /// One page of a database's deployments, most recent first.
    pub fn history(&self, req: &HistoryRequest, details: &mut AuditDetails) -> Result<HistoryResponse, AgentError> {
        if req.limit <= 0 || req.limit > MAX_HISTORY_LIMIT {
            return Err(AgentError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}"
            )));
        }
        if req.offset < 0 {
            return Err(AgentError::InvalidRequest("offset must not be negative".into()));
        }
        let database = self
            .store
            .find_database(&req.database)?
            .ok_or_else(|| AgentError::DatabaseNotFound(req.database.clone()))?;
        details.database_id = Some(database.id);

        let page = self.store.deployment_history(&database.name, req.limit, req.offset)?;
        details.note("limit", req.limit);
        details.note("offset", req.offset);
        details.note("count", page.deployments.len());
        Ok(page)
    }
}
