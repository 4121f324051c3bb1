//! HTTP transport for the agent
//!
//! `POST /v1/<operation>` with a JSON body, answered with JSON. `GET
//! /metrics` serves the Prometheus exposition when the `metrics` feature
//! is on. Each connection is served by a `may` coroutine.

use super::audit::{client_ip, CallContext};
use super::protocol::{Action, API_KEY_HEADER, CLIENT_ID_HEADER, REQUEST_ID_HEADER};
use super::rate_limit::RateLimiter;
use super::service::{Agent, AgentSettings, Reply};
use super::target::PgTargets;
use super::AgentError;
use crate::config::AgentConfig;
use crate::metadb::{MetadataStore, PgMetadataStore};
use may_minihttp::{HttpServer, HttpService, Request, Response};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

const JSON: &str = "Content-Type: application/json";
const TEXT: &str = "Content-Type: text/plain; charset=utf-8";

/// Request headers with lowercased names
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut headers = Headers::default();
        for (name, value) in pairs {
            headers.insert(name, value);
        }
        headers
    }
}

/// A response ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl From<Reply> for HttpReply {
    fn from(reply: Reply) -> Self {
        Self {
            status: reply.status,
            content_type: JSON,
            body: reply.body,
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        _ => "Internal Server Error",
    }
}

/// Route one request. Unknown routes are answered without authentication
/// or auditing.
pub fn route(agent: &Agent, method: &str, path: &str, headers: &Headers, body: &[u8]) -> HttpReply {
    if path == "/metrics" && method.eq_ignore_ascii_case("GET") {
        return metrics_reply();
    }

    let Some(action) = Action::from_path(path) else {
        return Reply::error(&AgentError::NotFound(path.to_string())).into();
    };
    if !method.eq_ignore_ascii_case("POST") {
        let mut reply: HttpReply = Reply::error(&AgentError::InvalidRequest(format!(
            "{} expects POST, got {}",
            action.path(),
            method
        )))
        .into();
        reply.status = 405;
        return reply;
    }

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut call = CallContext::new(action, request_id);
    call.client_id = headers.get(CLIENT_ID_HEADER).map(str::to_string);
    call.client_ip = client_ip(headers.get("x-forwarded-for"), headers.get("x-real-ip"));
    call.request_size_bytes = body.len();

    agent.call(&mut call, headers.get(API_KEY_HEADER), body).into()
}

#[cfg(feature = "metrics")]
fn metrics_reply() -> HttpReply {
    HttpReply {
        status: 200,
        content_type: TEXT,
        body: crate::metrics::METRICS.render().into_bytes(),
    }
}

#[cfg(not(feature = "metrics"))]
fn metrics_reply() -> HttpReply {
    HttpReply {
        status: 404,
        content_type: TEXT,
        body: b"metrics are disabled".to_vec(),
    }
}

#[derive(Clone)]
pub struct AgentService {
    agent: Arc<Agent>,
}

impl AgentService {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

impl HttpService for AgentService {
    fn call(&mut self, req: Request, res: &mut Response) -> io::Result<()> {
        let method = req.method().to_string();
        let path = req.path().to_string();
        let mut headers = Headers::default();
        for header in req.headers() {
            headers.insert(header.name, String::from_utf8_lossy(header.value).into_owned());
        }
        let mut body = Vec::new();
        req.body().read_to_end(&mut body)?;

        let reply = route(&self.agent, &method, &path, &headers, &body);
        res.status_code(usize::from(reply.status), reason(reply.status));
        res.header(reply.content_type);
        res.body_vec(reply.body);
        Ok(())
    }
}

/// Build an agent backed by PostgreSQL from `config`.
pub fn build_agent(config: &AgentConfig) -> Result<Agent, AgentError> {
    let store = PgMetadataStore::connect(&config.metadata)?;
    if config.initialize_schema {
        store.initialize()?;
    }
    Ok(Agent::new(
        Arc::new(store),
        Arc::new(PgTargets::new(config.targets.pool_settings())),
        RateLimiter::new(config.rate_limit.requests, config.rate_limit.window()),
        AgentSettings {
            statement_timeout: config.statement_timeout(),
            lock_timeout: Some(config.lock_timeout()),
        },
    ))
}

/// Serve `agent` on `addr` until the server stops.
pub fn serve(agent: Arc<Agent>, addr: &str) -> io::Result<()> {
    let server = HttpServer(AgentService::new(agent)).start(addr)?;
    log::info!("Agent listening on http://{}", addr);
    server
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "agent server stopped unexpectedly"))
}

/// Build the agent from `config` and serve it on the configured address.
pub fn run(config: &AgentConfig) -> Result<(), AgentError> {
    if let Some(workers) = config.workers {
        may::config().set_workers(workers);
    }
    let agent = Arc::new(build_agent(config)?);
    serve(agent, &config.bind_address).map_err(|e| AgentError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::auth::issue_key;
    use crate::mock::{MemoryMetadataStore, MemoryTargets};
    use std::time::Duration;

    fn agent() -> (Agent, Arc<MemoryMetadataStore>, String) {
        let store = Arc::new(MemoryMetadataStore::new());
        let issued = issue_key("ci", None, vec![], None, None);
        store.register_api_key(&issued.key).unwrap();
        let agent = Agent::new(
            store.clone(),
            Arc::new(MemoryTargets::new()),
            RateLimiter::new(10, Duration::from_secs(60)),
            AgentSettings::default(),
        );
        (agent, store, issued.secret)
    }

    #[test]
    fn test_unknown_route_is_not_audited() {
        let (agent, store, _) = agent();
        let reply = route(&agent, "POST", "/v1/drop_everything", &Headers::default(), b"{}");
        assert_eq!(reply.status, 404);
        assert!(store.audit_log().is_empty());
    }

    #[test]
    fn test_wrong_method() {
        let (agent, _, secret) = agent();
        let headers = Headers::from([("X-Client-Id", "ci"), ("X-Api-Key", secret.as_str())]);
        let reply = route(&agent, "GET", "/v1/ping", &headers, b"");
        assert_eq!(reply.status, 405);
        assert_eq!(reason(reply.status), "Method Not Allowed");
    }

    #[test]
    fn test_headers_feed_the_call_context() {
        let (agent, store, secret) = agent();
        let headers = Headers::from([
            ("X-Client-Id", "ci"),
            ("X-Api-Key", secret.as_str()),
            ("X-Request-Id", "req-42"),
            ("X-Forwarded-For", "10.1.2.3, 10.0.0.1"),
        ]);
        let reply = route(&agent, "POST", "/v1/ping", &headers, b"");
        assert_eq!(reply.status, 200);
        assert_eq!(reply.content_type, JSON);

        let audit = store.audit_log();
        assert_eq!(audit[0].request_id.as_deref(), Some("req-42"));
        assert_eq!(audit[0].client_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(audit[0].client_id.as_deref(), Some("ci"));
    }

    #[test]
    fn test_missing_key_is_unauthorized() {
        let (agent, store, _) = agent();
        let headers = Headers::from([("x-client-id", "ci")]);
        let reply = route(&agent, "POST", "/v1/ping", &headers, b"{}");
        assert_eq!(reply.status, 401);

        let audit = store.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].request_id.as_deref().unwrap_or_default().is_empty());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_route() {
        let (agent, _, _) = agent();
        let reply = route(&agent, "GET", "/metrics", &Headers::default(), b"");
        assert_eq!(reply.status, 200);
        assert_eq!(reply.content_type, TEXT);
    }
}
