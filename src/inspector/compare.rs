//! Schema comparison

use super::{IndexInfo, SchemaState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    Index,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftChange {
    /// Present on both sides with different content
    Modified,
    /// Expected but absent from the compared schema
    Missing,
    /// Present in the compared schema but not expected
    Extra,
}

/// One object that differs between two schema states
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Drift {
    pub kind: ObjectKind,
    pub name: String,
    pub change: DriftChange,
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.change) {
            (ObjectKind::Table, DriftChange::Modified) => write!(f, "Table {} schema drift detected", self.name),
            (ObjectKind::Table, DriftChange::Missing) => write!(f, "Missing table {}", self.name),
            (ObjectKind::Table, DriftChange::Extra) => write!(f, "Extra table {}", self.name),
            (ObjectKind::Index, DriftChange::Modified) => write!(f, "Index {} differs", self.name),
            (ObjectKind::Index, DriftChange::Missing) => write!(f, "Missing index {}", self.name),
            (ObjectKind::Index, DriftChange::Extra) => write!(f, "Extra index {}", self.name),
            (ObjectKind::Function, DriftChange::Modified) => write!(f, "Function {} differs", self.name),
            (ObjectKind::Function, DriftChange::Missing) => write!(f, "Missing function {}", self.name),
            (ObjectKind::Function, DriftChange::Extra) => write!(f, "Extra function {}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaComparison {
    pub is_identical: bool,
    /// Summary lines
    pub differences: Vec<String>,
    pub missing_tables: Vec<String>,
    pub extra_tables: Vec<String>,
    /// Display text of every drift that is not a missing or extra table
    pub schema_drift: Vec<String>,
    pub drift: Vec<Drift>,
    pub checksum_match: bool,
    pub local_checksum: String,
    pub remote_checksum: String,
}

/// Compare an expected schema (`local`) with an actual one (`remote`).
///
/// Missing means "in `local`, not in `remote`".
pub fn compare(local: &SchemaState, remote: &SchemaState) -> SchemaComparison {
    let mut comparison = SchemaComparison {
        checksum_match: local.checksum == remote.checksum,
        local_checksum: local.checksum.clone(),
        remote_checksum: remote.checksum.clone(),
        ..SchemaComparison::default()
    };
    if comparison.checksum_match {
        comparison.is_identical = true;
        return comparison;
    }

    let mut drift = Vec::new();

    let local_tables: BTreeMap<&str, &str> = local.tables.iter().map(|t| (t.name.as_str(), t.checksum.as_str())).collect();
    let remote_tables: BTreeMap<&str, &str> =
        remote.tables.iter().map(|t| (t.name.as_str(), t.checksum.as_str())).collect();
    diff_maps(ObjectKind::Table, &local_tables, &remote_tables, &mut drift);

    let signature = |i: &IndexInfo| (i.qualified_name(), i.signature());
    let local_indexes: BTreeMap<String, String> = local.indexes.iter().map(signature).collect();
    let remote_indexes: BTreeMap<String, String> = remote.indexes.iter().map(signature).collect();
    diff_maps(ObjectKind::Index, &local_indexes, &remote_indexes, &mut drift);

    let local_functions: BTreeMap<String, &str> =
        local.functions.iter().map(|f| (f.signature(), f.checksum.as_str())).collect();
    let remote_functions: BTreeMap<String, &str> =
        remote.functions.iter().map(|f| (f.signature(), f.checksum.as_str())).collect();
    diff_maps(ObjectKind::Function, &local_functions, &remote_functions, &mut drift);

    for d in &drift {
        match (d.kind, d.change) {
            (ObjectKind::Table, DriftChange::Missing) => comparison.missing_tables.push(d.name.clone()),
            (ObjectKind::Table, DriftChange::Extra) => comparison.extra_tables.push(d.name.clone()),
            _ => comparison.schema_drift.push(d.to_string()),
        }
    }

    comparison.is_identical = drift.is_empty();
    if !comparison.is_identical {
        comparison.differences.push("Schema states differ".to_string());
        if !comparison.missing_tables.is_empty() {
            comparison
                .differences
                .push(format!("Missing tables: {}", comparison.missing_tables.join(", ")));
        }
        if !comparison.extra_tables.is_empty() {
            comparison
                .differences
                .push(format!("Extra tables: {}", comparison.extra_tables.join(", ")));
        }
        if !comparison.schema_drift.is_empty() {
            comparison
                .differences
                .push(format!("Schema drift: {}", comparison.schema_drift.join(", ")));
        }
    }
    comparison.drift = drift;
    comparison
}

fn diff_maps<K, V>(kind: ObjectKind, local: &BTreeMap<K, V>, remote: &BTreeMap<K, V>, drift: &mut Vec<Drift>)
where
    K: Ord + ToString,
    V: PartialEq,
{
    for (name, value) in local {
        match remote.get(name) {
            None => drift.push(Drift {
                kind,
                name: name.to_string(),
                change: DriftChange::Missing,
            }),
            Some(other) if other != value => drift.push(Drift {
                kind,
                name: name.to_string(),
                change: DriftChange::Modified,
            }),
            Some(_) => {}
        }
    }
    for name in remote.keys().filter(|name| !local.contains_key(*name)) {
        drift.push(Drift {
            kind,
            name: name.to_string(),
            change: DriftChange::Extra,
        });
    }
}
