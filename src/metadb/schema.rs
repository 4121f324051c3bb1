//! DDL for the metadata database

use sea_query::{
    ColumnDef, Expr, ForeignKey, ForeignKeyAction, Index, IndexCreateStatement, PostgresQueryBuilder, Table,
    TableCreateStatement,
};

pub const DATABASES: &str = "databases";
pub const DEPLOYMENTS: &str = "deployments";
pub const DEPLOYMENT_MIGRATIONS: &str = "deployment_migrations";
pub const AUDIT_LOG: &str = "audit_log";
pub const API_KEYS: &str = "api_keys";

pub fn create_databases() -> TableCreateStatement {
    Table::create()
        .table(DATABASES)
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("name").string_len(255).not_null().unique_key())
        .col(ColumnDef::new("connection_string").text().not_null())
        .col(ColumnDef::new("description").text().null())
        .col(ColumnDef::new("environment").string_len(50).not_null().default("production"))
        .col(ColumnDef::new("is_active").boolean().not_null().default(true))
        .col(ColumnDef::new("tags").json_binary().not_null())
        .col(ColumnDef::new("created_by").string_len(255).null())
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new("updated_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned()
}

pub fn create_deployments() -> TableCreateStatement {
    Table::create()
        .table(DEPLOYMENTS)
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("database_id").uuid().not_null())
        .col(ColumnDef::new("version").string_len(64).not_null())
        .col(ColumnDef::new("manifest_version").string_len(64).not_null())
        .col(ColumnDef::new("status").string_len(20).not_null().default("pending"))
        .col(ColumnDef::new("applied_at").timestamp_with_time_zone().null())
        .col(ColumnDef::new("applied_by").string_len(255).null())
        .col(ColumnDef::new("checksum").string_len(64).not_null())
        .col(ColumnDef::new("execution_time_ms").big_integer().not_null().default(0))
        .col(ColumnDef::new("error_message").text().null())
        .col(ColumnDef::new("dry_run").boolean().not_null().default(false))
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .foreign_key(
            ForeignKey::create()
                .name("fk_deployments_database")
                .from(DEPLOYMENTS, "database_id")
                .to(DATABASES, "id")
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_owned()
}

pub fn create_deployment_migrations() -> TableCreateStatement {
    Table::create()
        .table(DEPLOYMENT_MIGRATIONS)
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("deployment_id").uuid().not_null())
        .col(ColumnDef::new("version").string_len(64).not_null())
        .col(ColumnDef::new("name").string_len(255).not_null())
        .col(ColumnDef::new("checksum").string_len(64).not_null())
        .col(ColumnDef::new("status").string_len(20).not_null())
        .col(ColumnDef::new("execution_time_ms").big_integer().not_null().default(0))
        .col(ColumnDef::new("error_message").text().null())
        .col(ColumnDef::new("applied_at").timestamp_with_time_zone().null())
        .foreign_key(
            ForeignKey::create()
                .name("fk_deployment_migrations_deployment")
                .from(DEPLOYMENT_MIGRATIONS, "deployment_id")
                .to(DEPLOYMENTS, "id")
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_owned()
}

pub fn create_audit_log() -> TableCreateStatement {
    Table::create()
        .table(AUDIT_LOG)
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("action").string_len(50).not_null())
        .col(ColumnDef::new("client_id").string_len(255).null())
        .col(ColumnDef::new("database_id").uuid().null())
        .col(ColumnDef::new("deployment_id").uuid().null())
        .col(ColumnDef::new("client_ip").string_len(64).null())
        .col(ColumnDef::new("request_id").string_len(64).null())
        .col(ColumnDef::new("status_code").integer().not_null())
        .col(ColumnDef::new("error_message").text().null())
        .col(ColumnDef::new("execution_time_ms").big_integer().not_null().default(0))
        .col(ColumnDef::new("request_size_bytes").big_integer().not_null().default(0))
        .col(ColumnDef::new("response_size_bytes").big_integer().not_null().default(0))
        .col(ColumnDef::new("metadata").json_binary().not_null())
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .foreign_key(
            ForeignKey::create()
                .name("fk_audit_log_database")
                .from(AUDIT_LOG, "database_id")
                .to(DATABASES, "id")
                .on_delete(ForeignKeyAction::SetNull),
        )
        .foreign_key(
            ForeignKey::create()
                .name("fk_audit_log_deployment")
                .from(AUDIT_LOG, "deployment_id")
                .to(DEPLOYMENTS, "id")
                .on_delete(ForeignKeyAction::SetNull),
        )
        .to_owned()
}

pub fn create_api_keys() -> TableCreateStatement {
    Table::create()
        .table(API_KEYS)
        .if_not_exists()
        .col(ColumnDef::new("key_id").string_len(255).not_null().primary_key())
        .col(ColumnDef::new("key_hash").string_len(64).not_null())
        .col(ColumnDef::new("description").text().null())
        .col(ColumnDef::new("permissions").json_binary().not_null())
        .col(ColumnDef::new("is_active").boolean().not_null().default(true))
        .col(ColumnDef::new("expires_at").timestamp_with_time_zone().null())
        .col(ColumnDef::new("last_used_at").timestamp_with_time_zone().null())
        .col(ColumnDef::new("usage_count").big_integer().not_null().default(0))
        .col(ColumnDef::new("created_by").string_len(255).null())
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned()
}

fn index(name: &str, table: &'static str, columns: &[&'static str]) -> IndexCreateStatement {
    let mut index = Index::create();
    index.if_not_exists().name(name).table(table);
    for column in columns {
        index.col(*column);
    }
    index
}

pub fn create_indexes() -> Vec<IndexCreateStatement> {
    vec![
        index("idx_deployments_database", DEPLOYMENTS, &["database_id", "applied_at"]),
        index("idx_deployment_migrations_deployment", DEPLOYMENT_MIGRATIONS, &["deployment_id"]),
        index("idx_audit_log_created_at", AUDIT_LOG, &["created_at"]),
    ]
}

/// Every statement needed for an empty metadata database, in dependency order.
pub fn statements() -> Vec<String> {
    let mut sql: Vec<String> = [
        create_databases(),
        create_deployments(),
        create_deployment_migrations(),
        create_audit_log(),
        create_api_keys(),
    ]
    .iter()
    .map(|table| table.build(PostgresQueryBuilder))
    .collect();
    sql.extend(create_indexes().iter().map(|index| index.build(PostgresQueryBuilder)));
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_created_before_their_references() {
        let sql = statements();
        let position = |table: &str| {
            sql.iter()
                .position(|s| s.starts_with(&format!("CREATE TABLE IF NOT EXISTS \"{table}\"")))
                .unwrap()
        };
        assert!(position(DATABASES) < position(DEPLOYMENTS));
        assert!(position(DEPLOYMENTS) < position(DEPLOYMENT_MIGRATIONS));
        assert!(position(DEPLOYMENTS) < position(AUDIT_LOG));
        assert_eq!(sql.len(), 8);
    }

    #[test]
    fn test_deployments_cascade_with_their_database() {
        let sql = create_deployments().build(PostgresQueryBuilder);
        assert!(sql.contains("REFERENCES \"databases\" (\"id\") ON DELETE CASCADE"));
        assert!(sql.contains("DEFAULT 'pending'"));
    }

    #[test]
    fn test_api_keys_store_only_a_hash() {
        let sql = create_api_keys().build(PostgresQueryBuilder);
        assert!(sql.contains("\"key_hash\" varchar(64) NOT NULL"));
        assert!(!sql.contains("secret"));
    }
}
