//! Best-effort audit logging of agent calls

use super::protocol::Action;
use crate::metadb::{AuditEntry, MetadataStore};
use chrono::Utc;
use serde_json::{Map, Value};
use std::time::Instant;
use uuid::Uuid;

/// Who called what, captured before the call is dispatched
#[derive(Debug, Clone)]
pub struct CallContext {
    pub action: Action,
    pub client_id: Option<String>,
    pub client_ip: String,
    pub request_id: String,
    pub request_size_bytes: usize,
    pub started: Instant,
}

impl CallContext {
    pub fn new(action: Action, request_id: impl Into<String>) -> Self {
        Self {
            action,
            client_id: None,
            client_ip: "unknown".to_string(),
            request_id: request_id.into(),
            request_size_bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// What an operation learned about its call, filled in as it runs
#[derive(Debug, Clone, Default)]
pub struct AuditDetails {
    pub database_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub metadata: Map<String, Value>,
}

impl AuditDetails {
    pub fn note(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// First `x-forwarded-for` hop, else `x-real-ip`, else `unknown`.
pub fn client_ip(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    forwarded_for
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|ip| !ip.is_empty()))
        .unwrap_or("unknown")
        .to_string()
}

pub fn entry(
    call: &CallContext,
    details: &AuditDetails,
    status_code: u16,
    error_message: Option<&str>,
    response_size_bytes: usize,
) -> AuditEntry {
    let mut metadata = details.metadata.clone();
    if let Some(client_id) = &call.client_id {
        metadata.insert("user_agent".into(), Value::String(format!("db-client/{client_id}")));
    }
    AuditEntry {
        action: call.action.as_str().to_string(),
        client_id: call.client_id.clone(),
        database_id: details.database_id,
        deployment_id: details.deployment_id,
        client_ip: Some(call.client_ip.clone()),
        request_id: Some(call.request_id.clone()),
        status_code,
        error_message: error_message.map(str::to_string),
        execution_time_ms: call.elapsed_ms(),
        request_size_bytes: i64::try_from(call.request_size_bytes).unwrap_or(i64::MAX),
        response_size_bytes: i64::try_from(response_size_bytes).unwrap_or(i64::MAX),
        metadata: Value::Object(metadata),
        created_at: Utc::now(),
    }
}

/// Write one audit row. A failed write is logged and otherwise ignored.
pub fn record(
    store: &dyn MetadataStore,
    call: &CallContext,
    details: &AuditDetails,
    status_code: u16,
    error_message: Option<&str>,
    response_size_bytes: usize,
) {
    let entry = entry(call, details, status_code, error_message, response_size_bytes);
    if let Err(e) = store.log_audit(&entry) {
        log::warn!(
            "Failed to write audit entry for {} (request {}): {}",
            entry.action,
            call.request_id,
            e
        );
    }
}
