//! Reverse engineering: live schema to [`Manifest`]

use super::{Catalog, ColumnInfo, InspectorError, SchemaState, TableInfo};
use crate::executor::DbError;
use crate::manifest::{Manifest, ManifestMetadata, SeedData};
use crate::migration::{Migration, MigrationVersion};
use crate::sql::quote_ident;
use std::collections::{BTreeMap, BTreeSet};

/// Tables in creation order: every table after the tables it references.
///
/// Ties are broken by name so the order is stable. Self references are
/// ignored; longer cycles are rejected.
pub fn creation_order(tables: &[TableInfo]) -> Result<Vec<&TableInfo>, InspectorError> {
    let by_name: BTreeMap<&str, &TableInfo> = tables.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut waiting_on: BTreeMap<&str, BTreeSet<&str>> = by_name
        .iter()
        .map(|(name, table)| {
            let deps = table
                .referenced_tables()
                .into_iter()
                .filter(|r| by_name.contains_key(r))
                .collect();
            (*name, deps)
        })
        .collect();

    let mut ordered = Vec::with_capacity(tables.len());
    let mut ready: BTreeSet<&str> = waiting_on
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| *name)
        .collect();

    while let Some(name) = ready.pop_first() {
        waiting_on.remove(name);
        ordered.push(by_name[name]);
        for (other, deps) in waiting_on.iter_mut() {
            if deps.remove(name) && deps.is_empty() {
                ready.insert(*other);
            }
        }
    }

    if !waiting_on.is_empty() {
        return Err(InspectorError::DependencyCycle(
            waiting_on.keys().map(|n| n.to_string()).collect(),
        ));
    }
    Ok(ordered)
}

fn column_definition(column: &ColumnInfo) -> String {
    let serial = column
        .default_value
        .as_deref()
        .filter(|d| d.starts_with("nextval("))
        .and_then(|_| match column.data_type.as_str() {
            "integer" => Some("SERIAL"),
            "bigint" => Some("BIGSERIAL"),
            "smallint" => Some("SMALLSERIAL"),
            _ => None,
        });

    let data_type: &str = match serial {
        Some(serial) => serial,
        None => &column.data_type,
    };
    let mut def = format!("{} {}", quote_ident(&column.name), data_type);
    if !column.is_nullable {
        def.push_str(" NOT NULL");
    }
    if serial.is_none() {
        if let Some(default) = &column.default_value {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
    }
    def
}

/// Plain column names are quoted; expressions and names the catalog already
/// quoted are used as given.
fn index_key(key: &str) -> String {
    let plain = key.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        quote_ident(key)
    } else {
        key.to_string()
    }
}

fn create_table_sql(table: &TableInfo, state: &SchemaState) -> String {
    let mut lines: Vec<String> = table.columns.iter().map(column_definition).collect();

    let pk: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| quote_ident(&c.name))
        .collect();
    if !pk.is_empty() {
        lines.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    }
    for column in &table.columns {
        if let Some(target) = &column.references {
            let mut line = format!("FOREIGN KEY ({}) REFERENCES {}", quote_ident(&column.name), quote_ident(target));
            if let Some(target_column) = &column.references_column {
                line.push_str(&format!(" ({})", quote_ident(target_column)));
            }
            lines.push(line);
        }
    }

    let mut sql = format!(
        "CREATE TABLE {} (\n    {}\n);",
        quote_ident(&table.name),
        lines.join(",\n    ")
    );
    for index in state.indexes_of(&table.name).filter(|i| !i.is_primary) {
        let columns: Vec<String> = index.columns.iter().map(|c| index_key(c)).collect();
        sql.push_str(&format!(
            "\nCREATE {}INDEX {} ON {} ({});",
            if index.is_unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(&table.name),
            columns.join(", ")
        ));
    }
    sql
}

/// Turn a captured schema into a manifest that recreates it: one
/// `create_<table>` migration per table in foreign-key order (with its
/// indexes), then one migration per function.
pub fn reverse_engineer(state: &SchemaState) -> Result<Manifest, InspectorError> {
    let mut migrations = Vec::new();
    let mut table_versions: BTreeMap<&str, MigrationVersion> = BTreeMap::new();
    let mut next = 1u64;

    for table in creation_order(&state.tables)? {
        let version = MigrationVersion::sequence(next);
        next += 1;
        let dependencies = table
            .referenced_tables()
            .into_iter()
            .filter_map(|r| table_versions.get(r).cloned())
            .collect();
        migrations.push(
            Migration::new(version.clone(), format!("create_{}", table.name), create_table_sql(table, state))
                .with_description(format!("Create {} table", table.name))
                .with_down(format!("DROP TABLE IF EXISTS {};", quote_ident(&table.name)))
                .with_dependencies(dependencies),
        );
        table_versions.insert(&table.name, version);
    }

    for function in &state.functions {
        let version = MigrationVersion::sequence(next);
        next += 1;
        let mut up = function.definition.trim().to_string();
        if !up.ends_with(';') {
            up.push(';');
        }
        migrations.push(
            Migration::new(version, format!("create_function_{}", function.name), up)
                .with_description(format!("Create {} function", function.name))
                .with_down(format!(
                    "DROP FUNCTION IF EXISTS {}({});",
                    quote_ident(&function.name),
                    function.arguments
                )),
        );
    }

    Ok(Manifest {
        description: "Extracted schema manifest".to_string(),
        migrations,
        metadata: ManifestMetadata {
            tags: vec!["extracted".to_string()],
            ..ManifestMetadata::default()
        },
        ..Manifest::default()
    })
}

/// Export the rows of `tables` as seed data for `environment`, skipping
/// empty tables.
pub fn export_seed_data(
    catalog: &dyn Catalog,
    tables: &[&TableInfo],
    environment: &str,
) -> Result<Vec<SeedData>, DbError> {
    let mut seeds = Vec::new();
    for table in tables {
        let rows = catalog.export_rows(&table.name)?;
        if !rows.is_empty() {
            seeds.push(SeedData::new(environment, table.name.clone(), rows));
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::fixtures::*;

    #[test]
    fn test_creation_order_follows_foreign_keys() {
        let tables = vec![
            table("comments", vec![pk("id"), fk("post_id", "posts"), fk("author_id", "users")]),
            table("posts", vec![pk("id"), fk("user_id", "users")]),
            table("users", vec![pk("id"), fk("manager_id", "users")]),
        ];
        let order: Vec<&str> = creation_order(&tables).unwrap().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(order, vec!["users", "posts", "comments"]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let tables = vec![
            table("a", vec![fk("b_id", "b")]),
            table("b", vec![fk("a_id", "a")]),
            table("c", vec![pk("id")]),
        ];
        match creation_order(&tables) {
            Err(InspectorError::DependencyCycle(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_reverse_engineered_manifest() {
        let manifest = reverse_engineer(&blog()).unwrap();
        manifest.validate().unwrap();

        let names: Vec<String> = manifest
            .migrations
            .iter()
            .map(|m| format!("{}__{}", m.version, m.name))
            .collect();
        assert_eq!(names, vec!["V001__create_users", "V002__create_posts", "V003__create_function_touch"]);

        let users = &manifest.migrations[0];
        assert!(users.up_sql.starts_with("CREATE TABLE \"users\""));
        assert!(users.up_sql.contains("PRIMARY KEY (\"id\")"));
        assert!(users.up_sql.contains("CREATE UNIQUE INDEX \"idx_users_email\" ON \"users\" (\"email\");"));
        assert!(!users.up_sql.contains("users_pkey"));
        assert_eq!(users.down_sql.as_deref(), Some("DROP TABLE IF EXISTS \"users\";"));

        let posts = &manifest.migrations[1];
        assert!(posts.up_sql.contains("FOREIGN KEY (\"user_id\") REFERENCES \"users\" (\"id\")"));
        assert_eq!(posts.dependencies, vec![MigrationVersion::sequence(1)]);
        assert_eq!(manifest.metadata.tags, vec!["extracted"]);

        assert_eq!(manifest.migrations[2].down_sql.as_deref(), Some("DROP FUNCTION IF EXISTS \"touch\"();"));
    }

    #[test]
    fn test_foreign_key_to_non_key_column_and_expression_index() {
        let mut owner = fk("owner_email", "users");
        owner.data_type = "character varying(255)".into();
        owner.references_column = Some("email".into());
        let state = SchemaState::new(
            vec![
                table("users", vec![pk("id"), column("email", "character varying(255)")]),
                table("accounts", vec![pk("id"), owner]),
            ],
            vec![
                index("idx_users_email_lower", "users", &["lower((email)::text)"], true),
                index("idx_users_id_email", "users", &["id", "email"], false),
            ],
            vec![],
        );
        let manifest = reverse_engineer(&state).unwrap();

        let users = &manifest.migrations[0];
        assert!(users
            .up_sql
            .contains("CREATE UNIQUE INDEX \"idx_users_email_lower\" ON \"users\" (lower((email)::text));"));
        assert!(users
            .up_sql
            .contains("CREATE INDEX \"idx_users_id_email\" ON \"users\" (\"id\", \"email\");"));

        let accounts = &manifest.migrations[1];
        assert!(accounts
            .up_sql
            .contains("FOREIGN KEY (\"owner_email\") REFERENCES \"users\" (\"email\")"));
    }

    #[test]
    fn test_overloaded_functions_drop_by_signature() {
        let function = |arguments: &str| crate::inspector::FunctionInfo {
            name: "total".into(),
            arguments: arguments.into(),
            definition: format!("CREATE OR REPLACE FUNCTION total({arguments}) RETURNS integer LANGUAGE sql AS $$ SELECT 1 $$"),
            checksum: String::new(),
        };
        let state = SchemaState::new(vec![], vec![], vec![function("a text"), function("a integer")]);
        let manifest = reverse_engineer(&state).unwrap();

        let downs: Vec<&str> = manifest.migrations.iter().filter_map(|m| m.down_sql.as_deref()).collect();
        assert_eq!(
            downs,
            vec![
                "DROP FUNCTION IF EXISTS \"total\"(a integer);",
                "DROP FUNCTION IF EXISTS \"total\"(a text);"
            ]
        );
    }

    #[test]
    fn test_serial_columns_are_recreated_as_serial() {
        let mut id = pk("id");
        id.default_value = Some("nextval('users_id_seq'::regclass)".into());
        assert_eq!(column_definition(&id), "\"id\" SERIAL NOT NULL");

        let mut created = column("created_at", "timestamp with time zone");
        created.default_value = Some("now()".into());
        assert_eq!(column_definition(&created), "\"created_at\" timestamp with time zone DEFAULT now()");
    }
}
