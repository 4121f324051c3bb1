//! Tests against a live PostgreSQL server
//!
//! Set `SCHEMAGUARD_TEST_DATABASE_URL` to a connection string whose user may
//! create databases. Every test works in its own scratch database, dropped
//! afterwards. Without the variable the tests return immediately.

use schemaguard::agent::auth::issue_key;
use schemaguard::agent::protocol::{BootstrapResponse, CompareResponse, DeployResponse, HistoryResponse};
use schemaguard::agent::{route, Agent, AgentSettings, Headers, PgTargets, RateLimiter};
use schemaguard::connection::with_database;
use schemaguard::inspector::{capture_live, compare, expected_state};
use schemaguard::metadb::{DeploymentStatus, MetadataStore, NewDatabase, NewDeployment, PgMetadataStore};
use schemaguard::migration::{
    MigrateOptions, Migration, MigrationSet, MigrationVersion, Migrator, PgHistoryStore, RecordStatus,
    RollbackOptions,
};
use schemaguard::sql::quote_ident;
use schemaguard::{connect, DatabaseConfig, Manifest, MayPostgresExecutor, PoolSettings, SqlExecutor};
use std::sync::Arc;
use std::time::Duration;

const URL_VAR: &str = "SCHEMAGUARD_TEST_DATABASE_URL";

/// A database created for one test and dropped with it
struct Scratch {
    admin: MayPostgresExecutor,
    name: String,
    url: String,
}

impl Scratch {
    fn create() -> Option<Self> {
        let base = std::env::var(URL_VAR).ok().filter(|url| !url.is_empty())?;
        let admin = MayPostgresExecutor::new(connect(&base).expect("connect to test server"));
        let name = format!("sg_it_{}", uuid::Uuid::new_v4().simple());
        admin
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(&name)))
            .expect("create scratch database");
        Some(Self {
            url: with_database(&base, &name),
            admin,
            name,
        })
    }

    fn executor(&self) -> MayPostgresExecutor {
        MayPostgresExecutor::new(connect(&self.url).expect("connect to scratch database"))
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let sql = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(&self.name));
        if let Err(e) = self.admin.batch_execute(&sql) {
            log::warn!("Failed to drop {}: {}", self.name, e);
        }
    }
}

fn v(s: &str) -> MigrationVersion {
    MigrationVersion::parse(s).unwrap()
}

fn migrations() -> MigrationSet {
    [
        Migration::new(
            v("V001"),
            "create_customers",
            "CREATE TABLE customers (id BIGINT PRIMARY KEY, name TEXT NOT NULL);",
        )
        .with_down("DROP TABLE customers;"),
        Migration::new(
            v("V002"),
            "create_invoices",
            "CREATE TABLE invoices (id BIGINT PRIMARY KEY, customer_id BIGINT REFERENCES customers (id));\n\
             CREATE INDEX idx_invoices_customer ON invoices (customer_id);",
        )
        .with_down("DROP TABLE invoices;")
        .with_dependencies(vec![v("V001")]),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_migrate_capture_and_rollback() {
    let Some(scratch) = Scratch::create() else {
        return;
    };
    let executor = scratch.executor();
    let store = PgHistoryStore::new(&executor);
    let migrator = Migrator::new(migrations());

    let report = migrator.migrate(&store, &MigrateOptions::default()).unwrap();
    assert_eq!(report.versions(RecordStatus::Applied), vec![v("V001"), v("V002")]);
    assert!(migrator.status(&store).unwrap().is_up_to_date());
    assert!(migrator.migrate(&store, &MigrateOptions::default()).unwrap().outcomes.is_empty());

    let live = capture_live(&executor, "public", Some(Duration::from_secs(30))).unwrap();
    let names: Vec<&str> = live.tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["customers", "invoices"]);
    assert!(live.indexes.iter().any(|i| i.name == "idx_invoices_customer"));

    let expected = expected_state(&executor, migrator.migrations(), None).unwrap();
    let comparison = compare(&expected, &live);
    assert!(comparison.is_identical, "unexpected drift: {:?}", comparison.differences);

    executor.batch_execute("ALTER TABLE customers ADD COLUMN note TEXT").unwrap();
    let drifted = capture_live(&executor, "public", None).unwrap();
    assert!(!compare(&expected, &drifted).is_identical);

    let report = migrator.rollback(&store, &v("V001"), &RollbackOptions::default()).unwrap();
    assert_eq!(report.versions(RecordStatus::RolledBack), vec![v("V002")]);
    let after = capture_live(&executor, "public", None).unwrap();
    assert_eq!(after.tables.len(), 1);
}

#[test]
fn test_failed_migration_keeps_earlier_commits() {
    let Some(scratch) = Scratch::create() else {
        return;
    };
    let executor = scratch.executor();
    let store = PgHistoryStore::new(&executor);
    let mut set = migrations();
    set.insert(Migration::new(v("V003"), "broken", "CREATE TABLE broken (id BIGINT REFERENCES nowhere (id));"));

    assert!(Migrator::new(set).migrate(&store, &MigrateOptions::default()).is_err());
    let status = Migrator::new(migrations()).status(&store).unwrap();
    assert!(status.is_up_to_date());
}

#[test]
fn test_metadata_store() {
    let Some(scratch) = Scratch::create() else {
        return;
    };
    let store = PgMetadataStore::connect(&DatabaseConfig {
        url: scratch.url.clone(),
        ..DatabaseConfig::default()
    })
    .unwrap();
    store.initialize().unwrap();
    store.initialize().unwrap();

    let database = store
        .register_database(&NewDatabase {
            name: "orders".into(),
            connection_string: "postgresql://app:app@db:5432/orders".into(),
            tags: vec!["eu".into()],
            ..NewDatabase::default()
        })
        .unwrap();
    assert_eq!(database.environment, "production");
    assert_eq!(store.find_database("orders").unwrap().unwrap().tags, vec!["eu".to_string()]);

    let mut ids = Vec::new();
    for manifest_version in ["1.0.0", "1.1.0", "1.2.0"] {
        let deployment = store
            .create_deployment(&NewDeployment {
                database_id: database.id,
                version: manifest_version.into(),
                manifest_version: manifest_version.into(),
                applied_by: Some("ci".into()),
                checksum: "abc".into(),
                dry_run: false,
            })
            .unwrap();
        ids.push(deployment.id);
    }
    store.finish_deployment(ids[0], DeploymentStatus::Applied, 12, None).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    store
        .finish_deployment(ids[1], DeploymentStatus::Failed, 3, Some("boom"))
        .unwrap();

    let page = store.deployment_history("orders", 2, 0).unwrap();
    assert_eq!(page.total_count, 3);
    assert!(page.has_more);
    assert_eq!(page.deployments[0].deployment.id, ids[1]);
    assert_eq!(page.deployments[0].deployment.error_message.as_deref(), Some("boom"));
    assert_eq!(page.deployments[1].deployment.id, ids[0]);
    let last = store.deployment_history("orders", 2, 2).unwrap();
    assert_eq!(last.deployments[0].deployment.status, DeploymentStatus::Pending);
    assert!(!last.has_more);

    let issued = issue_key("ci", Some("pipeline".into()), vec!["deploy".into()], None, None);
    store.register_api_key(&issued.key).unwrap();
    store.touch_api_key("ci").unwrap();
    let key = store.find_api_key("ci").unwrap().unwrap();
    assert_eq!(key.usage_count, 1);
    assert_eq!(key.permissions, vec!["deploy".to_string()]);
    assert!(store.revoke_api_key("ci").unwrap());
    assert!(!store.revoke_api_key("nobody").unwrap());
    assert!(!store.find_api_key("ci").unwrap().unwrap().is_active);

    let reissued = issue_key("ci", None, vec![], None, None);
    store.register_api_key(&reissued.key).unwrap();
    let key = store.find_api_key("ci").unwrap().unwrap();
    assert!(key.is_active);
    assert_eq!(key.usage_count, 0);
    assert_eq!(key.key_hash, reissued.key.key_hash);
    assert_eq!(store.list_api_keys().unwrap().len(), 1);
}

#[test]
fn test_agent_bootstrap_deploy_history() {
    let Some(meta) = Scratch::create() else {
        return;
    };
    let Some(target) = Scratch::create() else {
        return;
    };

    let store = Arc::new(
        PgMetadataStore::connect(&DatabaseConfig {
            url: meta.url.clone(),
            ..DatabaseConfig::default()
        })
        .unwrap(),
    );
    store.initialize().unwrap();
    let issued = issue_key("ci", None, vec![], None, None);
    store.register_api_key(&issued.key).unwrap();

    let agent = Agent::new(
        store.clone(),
        Arc::new(PgTargets::new(PoolSettings {
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        })),
        RateLimiter::new(100, Duration::from_secs(60)),
        AgentSettings {
            statement_timeout: Some(Duration::from_secs(30)),
            lock_timeout: Some(Duration::from_secs(10)),
        },
    );
    let headers = Headers::from([("x-client-id", "ci"), ("x-api-key", issued.secret.as_str())]);
    let post = |path: &str, body: serde_json::Value| {
        route(&agent, "POST", path, &headers, &serde_json::to_vec(&body).unwrap())
    };

    let first: Vec<Migration> = migrations().iter().take(1).cloned().collect();
    let release = Manifest {
        migrations: first,
        ..Manifest::default()
    };
    let reply = post(
        "/v1/bootstrap",
        serde_json::json!({
            "database": "billing",
            "connection_string": target.url,
            "manifest": release,
        }),
    );
    assert_eq!(reply.status, 200, "{}", String::from_utf8_lossy(&reply.body));
    let bootstrap: BootstrapResponse = serde_json::from_slice(&reply.body).unwrap();
    assert!(bootstrap.registered);
    assert_eq!(bootstrap.deployment.status, DeploymentStatus::Applied);

    let full = Manifest {
        migrations: migrations().iter().cloned().collect(),
        ..Manifest::default()
    };
    let compared: CompareResponse = serde_json::from_slice(
        &post("/v1/compare", serde_json::json!({"database": "billing", "manifest": full})).body,
    )
    .unwrap();
    assert_eq!(compared.pending_migrations, vec![v("V002")]);

    let reply = post("/v1/deploy", serde_json::json!({"database": "billing", "manifest": full}));
    let deployed: DeployResponse = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(deployed.status, DeploymentStatus::Applied);
    assert_eq!(deployed.results.len(), 1);

    let history: HistoryResponse =
        serde_json::from_slice(&post("/v1/history", serde_json::json!({"database": "billing"})).body).unwrap();
    assert_eq!(history.total_count, 2);
    assert_eq!(history.deployments[0].deployment.id, deployed.deployment_id);
    assert_eq!(history.deployments[0].migrations[0].version, "V002");
}
