//! PostgreSQL-backed [`MetadataStore`]

use super::schema::{self, API_KEYS, AUDIT_LOG, DATABASES, DEPLOYMENTS, DEPLOYMENT_MIGRATIONS};
use super::{
    ApiKey, AuditEntry, Database, Deployment, DeploymentEntry, DeploymentMigration, DeploymentPage,
    DeploymentStatus, MetadataStore, NewDatabase, NewDeployment, DEFAULT_DATABASE_ENVIRONMENT,
};
use crate::connection::ConnectionError;
use crate::executor::{column, DbError, SqlExecutor};
use crate::migration::MigrationVersion;
use crate::pool::{ConnectionPool, DatabaseConfig};
use chrono::Utc;
use may_postgres::Row;
use std::collections::HashMap;
use uuid::Uuid;

const DATABASE_COLUMNS: &str = "id, name, connection_string, description, environment, is_active, tags, \
                                created_by, created_at, updated_at";
const DEPLOYMENT_COLUMNS: &str = "d.id, d.database_id, d.version, d.manifest_version, d.status, d.applied_at, \
                                  d.applied_by, d.checksum, d.execution_time_ms, d.error_message, d.dry_run, \
                                  d.created_at";
const MIGRATION_COLUMNS: &str =
    "id, deployment_id, version, name, checksum, status, execution_time_ms, error_message, applied_at";
const API_KEY_COLUMNS: &str = "key_id, key_hash, description, permissions, is_active, expires_at, last_used_at, \
                               usage_count, created_by, created_at";

pub struct PgMetadataStore {
    pool: ConnectionPool,
}

impl PgMetadataStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Pool connections to the metadata database described by `config`.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        Ok(Self::new(ConnectionPool::connect(&config.url, config.pool_settings())?))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

fn string_list(row: &Row, idx: usize) -> Result<Vec<String>, DbError> {
    let value: serde_json::Value = column(row, idx)?;
    serde_json::from_value(value).map_err(|e| DbError::Parse(format!("column {idx}: {e}")))
}

fn database_from_row(row: &Row) -> Result<Database, DbError> {
    Ok(Database {
        id: column(row, 0)?,
        name: column(row, 1)?,
        connection_string: column(row, 2)?,
        description: column(row, 3)?,
        environment: column(row, 4)?,
        is_active: column(row, 5)?,
        tags: string_list(row, 6)?,
        created_by: column(row, 7)?,
        created_at: column(row, 8)?,
        updated_at: column(row, 9)?,
    })
}

fn deployment_from_row(row: &Row) -> Result<Deployment, DbError> {
    let status: String = column(row, 4)?;
    Ok(Deployment {
        id: column(row, 0)?,
        database_id: column(row, 1)?,
        version: column(row, 2)?,
        manifest_version: column(row, 3)?,
        status: status.parse().map_err(DbError::Parse)?,
        applied_at: column(row, 5)?,
        applied_by: column(row, 6)?,
        checksum: column(row, 7)?,
        execution_time_ms: column(row, 8)?,
        error_message: column(row, 9)?,
        dry_run: column(row, 10)?,
        created_at: column(row, 11)?,
    })
}

fn migration_from_row(row: &Row) -> Result<DeploymentMigration, DbError> {
    let status: String = column(row, 5)?;
    Ok(DeploymentMigration {
        id: column(row, 0)?,
        deployment_id: column(row, 1)?,
        version: column(row, 2)?,
        name: column(row, 3)?,
        checksum: column(row, 4)?,
        status: status.parse().map_err(DbError::Parse)?,
        execution_time_ms: column(row, 6)?,
        error_message: column(row, 7)?,
        applied_at: column(row, 8)?,
    })
}

fn api_key_from_row(row: &Row) -> Result<ApiKey, DbError> {
    Ok(ApiKey {
        key_id: column(row, 0)?,
        key_hash: column(row, 1)?,
        description: column(row, 2)?,
        permissions: string_list(row, 3)?,
        is_active: column(row, 4)?,
        expires_at: column(row, 5)?,
        last_used_at: column(row, 6)?,
        usage_count: column(row, 7)?,
        created_by: column(row, 8)?,
        created_at: column(row, 9)?,
    })
}

/// Migration rows in version order; unparsable versions sort last by text.
fn sort_migrations(migrations: &mut [DeploymentMigration]) {
    migrations.sort_by(|a, b| {
        match (MigrationVersion::parse(&a.version), MigrationVersion::parse(&b.version)) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.version.cmp(&b.version),
        }
    });
}

impl MetadataStore for PgMetadataStore {
    fn initialize(&self) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        for statement in schema::statements() {
            conn.batch_execute(&statement)?;
        }
        log::info!("Metadata schema ready");
        Ok(())
    }

    fn register_database(&self, database: &NewDatabase) -> Result<Database, DbError> {
        let now = Utc::now();
        let registered = Database {
            id: Uuid::new_v4(),
            name: database.name.clone(),
            connection_string: database.connection_string.clone(),
            description: database.description.clone(),
            environment: database
                .environment
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_ENVIRONMENT.to_string()),
            is_active: true,
            tags: database.tags.clone(),
            created_by: database.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        let tags = serde_json::json!(registered.tags);

        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO {DATABASES} ({DATABASE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"),
            &[
                &registered.id,
                &registered.name,
                &registered.connection_string,
                &registered.description,
                &registered.environment,
                &registered.is_active,
                &tags,
                &registered.created_by,
                &registered.created_at,
                &registered.updated_at,
            ],
        )?;
        log::info!("Registered database {} ({})", registered.name, registered.environment);
        Ok(registered)
    }

    fn find_database(&self, name: &str) -> Result<Option<Database>, DbError> {
        let conn = self.pool.get()?;
        conn.query_all(
            &format!("SELECT {DATABASE_COLUMNS} FROM {DATABASES} WHERE name = $1"),
            &[&name],
        )?
        .first()
        .map(database_from_row)
        .transpose()
    }

    fn list_databases(&self) -> Result<Vec<Database>, DbError> {
        let conn = self.pool.get()?;
        conn.query_all(&format!("SELECT {DATABASE_COLUMNS} FROM {DATABASES} ORDER BY name"), &[])?
            .iter()
            .map(database_from_row)
            .collect()
    }

    fn create_deployment(&self, deployment: &NewDeployment) -> Result<Deployment, DbError> {
        let created = Deployment {
            id: Uuid::new_v4(),
            database_id: deployment.database_id,
            version: deployment.version.clone(),
            manifest_version: deployment.manifest_version.clone(),
            status: DeploymentStatus::Pending,
            applied_at: None,
            applied_by: deployment.applied_by.clone(),
            checksum: deployment.checksum.clone(),
            execution_time_ms: 0,
            error_message: None,
            dry_run: deployment.dry_run,
            created_at: Utc::now(),
        };
        let status = created.status.as_str();

        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO {DEPLOYMENTS} \
                 (id, database_id, version, manifest_version, status, applied_by, checksum, dry_run, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ),
            &[
                &created.id,
                &created.database_id,
                &created.version,
                &created.manifest_version,
                &status,
                &created.applied_by,
                &created.checksum,
                &created.dry_run,
                &created.created_at,
            ],
        )?;
        Ok(created)
    }

    fn finish_deployment(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        execution_time_ms: i64,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        let status = status.as_str();
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "UPDATE {DEPLOYMENTS} SET status = $2, execution_time_ms = $3, error_message = $4, \
                 applied_at = CURRENT_TIMESTAMP WHERE id = $1"
            ),
            &[&id, &status, &execution_time_ms, &error_message],
        )?;
        Ok(())
    }

    fn record_migration(&self, migration: &DeploymentMigration) -> Result<(), DbError> {
        let status = migration.status.as_str();
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO {DEPLOYMENT_MIGRATIONS} ({MIGRATION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ),
            &[
                &migration.id,
                &migration.deployment_id,
                &migration.version,
                &migration.name,
                &migration.checksum,
                &status,
                &migration.execution_time_ms,
                &migration.error_message,
                &migration.applied_at,
            ],
        )?;
        Ok(())
    }

    fn deployment_history(&self, database: &str, limit: i64, offset: i64) -> Result<DeploymentPage, DbError> {
        let conn = self.pool.get()?;
        let total_count: i64 = column(
            &conn.query_one(
                &format!(
                    "SELECT COUNT(*) FROM {DEPLOYMENTS} d JOIN {DATABASES} db ON d.database_id = db.id \
                     WHERE db.name = $1"
                ),
                &[&database],
            )?,
            0,
        )?;

        let deployments = conn
            .query_all(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM {DEPLOYMENTS} d JOIN {DATABASES} db ON d.database_id = db.id \
                     WHERE db.name = $1 \
                     ORDER BY d.applied_at DESC NULLS LAST, d.created_at DESC \
                     LIMIT $2 OFFSET $3"
                ),
                &[&database, &limit, &offset],
            )?
            .iter()
            .map(deployment_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let ids: Vec<Uuid> = deployments.iter().map(|d| d.id).collect();
        let mut by_deployment: HashMap<Uuid, Vec<DeploymentMigration>> = HashMap::new();
        if !ids.is_empty() {
            for row in conn.query_all(
                &format!("SELECT {MIGRATION_COLUMNS} FROM {DEPLOYMENT_MIGRATIONS} WHERE deployment_id = ANY($1)"),
                &[&ids],
            )? {
                let migration = migration_from_row(&row)?;
                by_deployment.entry(migration.deployment_id).or_default().push(migration);
            }
        }

        let has_more = offset + (deployments.len() as i64) < total_count;
        let deployments = deployments
            .into_iter()
            .map(|deployment| {
                let mut migrations = by_deployment.remove(&deployment.id).unwrap_or_default();
                sort_migrations(&mut migrations);
                DeploymentEntry { deployment, migrations }
            })
            .collect();

        Ok(DeploymentPage {
            deployments,
            total_count,
            has_more,
        })
    }

    fn log_audit(&self, entry: &AuditEntry) -> Result<(), DbError> {
        let id = Uuid::new_v4();
        let status_code = i32::from(entry.status_code);
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO {AUDIT_LOG} \
                 (id, action, client_id, database_id, deployment_id, client_ip, request_id, status_code, \
                  error_message, execution_time_ms, request_size_bytes, response_size_bytes, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
            ),
            &[
                &id,
                &entry.action,
                &entry.client_id,
                &entry.database_id,
                &entry.deployment_id,
                &entry.client_ip,
                &entry.request_id,
                &status_code,
                &entry.error_message,
                &entry.execution_time_ms,
                &entry.request_size_bytes,
                &entry.response_size_bytes,
                &entry.metadata,
                &entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn register_api_key(&self, key: &ApiKey) -> Result<(), DbError> {
        let permissions = serde_json::json!(key.permissions);
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO {API_KEYS} ({API_KEY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (key_id) DO UPDATE SET key_hash = EXCLUDED.key_hash, \
                 description = EXCLUDED.description, permissions = EXCLUDED.permissions, \
                 is_active = EXCLUDED.is_active, expires_at = EXCLUDED.expires_at, \
                 last_used_at = EXCLUDED.last_used_at, usage_count = EXCLUDED.usage_count, \
                 created_by = EXCLUDED.created_by, created_at = EXCLUDED.created_at"
            ),
            &[
                &key.key_id,
                &key.key_hash,
                &key.description,
                &permissions,
                &key.is_active,
                &key.expires_at,
                &key.last_used_at,
                &key.usage_count,
                &key.created_by,
                &key.created_at,
            ],
        )?;
        Ok(())
    }

    fn find_api_key(&self, key_id: &str) -> Result<Option<ApiKey>, DbError> {
        let conn = self.pool.get()?;
        conn.query_all(
            &format!("SELECT {API_KEY_COLUMNS} FROM {API_KEYS} WHERE key_id = $1"),
            &[&key_id],
        )?
        .first()
        .map(api_key_from_row)
        .transpose()
    }

    fn touch_api_key(&self, key_id: &str) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "UPDATE {API_KEYS} SET last_used_at = CURRENT_TIMESTAMP, usage_count = usage_count + 1 \
                 WHERE key_id = $1"
            ),
            &[&key_id],
        )?;
        Ok(())
    }

    fn revoke_api_key(&self, key_id: &str) -> Result<bool, DbError> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            &format!("UPDATE {API_KEYS} SET is_active = false WHERE key_id = $1"),
            &[&key_id],
        )?;
        Ok(updated > 0)
    }

    fn list_api_keys(&self) -> Result<Vec<ApiKey>, DbError> {
        let conn = self.pool.get()?;
        conn.query_all(&format!("SELECT {API_KEY_COLUMNS} FROM {API_KEYS} ORDER BY created_at"), &[])?
            .iter()
            .map(api_key_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::RecordStatus;

    fn row(version: &str) -> DeploymentMigration {
        DeploymentMigration {
            id: Uuid::new_v4(),
            deployment_id: Uuid::nil(),
            version: version.into(),
            name: version.into(),
            checksum: String::new(),
            status: RecordStatus::Applied,
            execution_time_ms: 0,
            error_message: None,
            applied_at: None,
        }
    }

    #[test]
    fn test_migrations_sort_by_version_not_text() {
        let mut rows = vec![row("1.10.0"), row("garbage"), row("1.9.0"), row("1.0.0")];
        sort_migrations(&mut rows);
        let versions: Vec<&str> = rows.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.9.0", "1.10.0", "garbage"]);
    }

    #[test]
    fn test_connect_rejects_bad_url_without_network() {
        let config = DatabaseConfig {
            url: "not a url".into(),
            ..DatabaseConfig::default()
        };
        assert!(PgMetadataStore::connect(&config).is_err());
    }
}
