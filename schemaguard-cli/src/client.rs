//! Blocking client for the deployment agent's JSON API

use schemaguard::agent::protocol::{
    Action, BootstrapRequest, BootstrapResponse, CompareRequest, CompareResponse, DeployRequest, DeployResponse,
    DownloadRequest, DownloadResponse, ErrorBody, HistoryRequest, HistoryResponse, PingRequest, PingResponse,
    API_KEY_HEADER, CLIENT_ID_HEADER, REQUEST_ID_HEADER,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_AGENT_URL: &str = "http://127.0.0.1:7437";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("agent answered {status} ({kind}): {message}")]
    Agent { status: u16, kind: String, message: String },

    #[error("could not reach agent: {0}")]
    Transport(String),

    #[error("invalid response from agent: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Map a non-2xx answer to an error, using the JSON error body when the
    /// agent sent one.
    pub fn from_status(status: u16, body: &str) -> Self {
        let (kind, message) = match serde_json::from_str::<ErrorBody>(body) {
            Ok(body) => (body.error, body.message),
            Err(_) => ("unknown".to_string(), body.trim().to_string()),
        };
        if status == 401 {
            ClientError::Unauthorized(message)
        } else {
            ClientError::Agent { status, kind, message }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}

pub struct AgentClient {
    base_url: String,
    client_id: String,
    api_key: String,
    http: ureq::Agent,
}

impl AgentClient {
    pub fn new(base_url: &str, client_id: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            api_key: api_key.into(),
            http: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn url(&self, action: Action) -> String {
        format!("{}{}", self.base_url, action.path())
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(&self, action: Action, request: &Req) -> Result<Resp, ClientError> {
        let body = serde_json::to_vec(request)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        log::debug!("POST {} (request {})", self.url(action), request_id);

        let result = self
            .http
            .post(&self.url(action))
            .set("Content-Type", "application/json")
            .set(CLIENT_ID_HEADER, &self.client_id)
            .set(API_KEY_HEADER, &self.api_key)
            .set(REQUEST_ID_HEADER, &request_id)
            .send_bytes(&body);

        match result {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                Ok(serde_json::from_str(&text)?)
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                Err(ClientError::from_status(status, &text))
            }
            Err(ureq::Error::Transport(transport)) => Err(ClientError::Transport(transport.to_string())),
        }
    }

    pub fn ping(&self) -> Result<PingResponse, ClientError> {
        self.call(
            Action::Ping,
            &PingRequest {
                client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        )
    }

    pub fn compare(&self, request: &CompareRequest) -> Result<CompareResponse, ClientError> {
        self.call(Action::Compare, request)
    }

    pub fn download(&self, request: &DownloadRequest) -> Result<DownloadResponse, ClientError> {
        self.call(Action::Download, request)
    }

    pub fn deploy(&self, request: &DeployRequest) -> Result<DeployResponse, ClientError> {
        self.call(Action::Deploy, request)
    }

    pub fn bootstrap(&self, request: &BootstrapRequest) -> Result<BootstrapResponse, ClientError> {
        self.call(Action::Bootstrap, request)
    }

    pub fn history(&self, request: &HistoryRequest) -> Result<HistoryResponse, ClientError> {
        self.call(Action::History, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_is_decoded() {
        let err = ClientError::from_status(404, r#"{"error":"database_not_found","message":"Database orders is not registered"}"#);
        match err {
            ClientError::Agent { status, kind, message } => {
                assert_eq!(status, 404);
                assert_eq!(kind, "database_not_found");
                assert!(message.contains("orders"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unauthorized_is_distinguished() {
        let err = ClientError::from_status(401, r#"{"error":"unauthenticated","message":"Invalid API key"}"#);
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "authentication failed: Invalid API key");
    }

    #[test]
    fn test_plain_text_body() {
        let err = ClientError::from_status(502, "bad gateway\n");
        assert_eq!(err.to_string(), "agent answered 502 (unknown): bad gateway");
    }

    #[test]
    fn test_urls() {
        let client = AgentClient::new("http://agent:7437/", "ci", "sg_x", Duration::from_secs(5));
        assert_eq!(client.url(Action::History), "http://agent:7437/v1/history");
    }
}
