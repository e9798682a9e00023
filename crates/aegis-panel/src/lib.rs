use std::time::Duration;

use aegis_common::config::PanelConfig;
use aegis_core::{ResourceSnapshot, ResourceState};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Value, json};
use url::Url;

/// Upstream failure classification. `Transient` and `Timeout` are the
/// only variants a caller may retry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PanelError {
    #[error("panel rejected the credentials")]
    Unauthorized,
    #[error("panel resource not found")]
    NotFound,
    #[error("transient panel failure: {0}")]
    Transient(String),
    #[error("panel request timed out")]
    Timeout,
    #[error("panel failure: {0}")]
    Fatal(String),
}

impl PanelError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSignal {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

/// Everything the executor needs from the hosting panel. Implemented by
/// `HttpPanelClient` in production and by in-memory fakes in tests.
pub trait PanelApi: Send + Sync {
    fn list_servers(&self) -> Result<Value, PanelError>;
    fn power_action(&self, resource_id: &str, signal: PowerSignal) -> Result<Value, PanelError>;
    fn send_command(&self, resource_id: &str, command: &str) -> Result<Value, PanelError>;
    fn resource_usage(&self, resource_id: &str) -> Result<Value, PanelError>;
    fn read_file(&self, resource_id: &str, path: &str) -> Result<Value, PanelError>;
    fn write_file(&self, resource_id: &str, path: &str, content: &str)
    -> Result<Value, PanelError>;
    fn delete_files(&self, resource_id: &str, files: &[String]) -> Result<Value, PanelError>;
    fn create_backup(&self, resource_id: &str, name: Option<&str>) -> Result<Value, PanelError>;
    fn restore_backup(&self, resource_id: &str, backup_id: &str) -> Result<Value, PanelError>;
    fn create_database(&self, resource_id: &str, name: &str) -> Result<Value, PanelError>;
    fn delete_database(&self, resource_id: &str, database_id: &str) -> Result<Value, PanelError>;
}

/// Parses a `resource_usage` response into the snapshot the risk
/// assessment consumes. Anything unparseable degrades to `unknown`.
pub fn snapshot_from_usage(body: &Value) -> ResourceSnapshot {
    let attributes = &body["attributes"];
    let state = attributes["current_state"]
        .as_str()
        .map(ResourceState::parse)
        .unwrap_or(ResourceState::Unknown);
    let active_players = attributes["players"]["online"].as_u64().unwrap_or(0) as u32;
    ResourceSnapshot {
        state,
        active_players,
    }
}

/// Blocking HTTP client for the panel's client API. Holds the bearer
/// token for the lifetime of the process; the token never appears in
/// logs or errors.
pub struct HttpPanelClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpPanelClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, PanelError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| PanelError::Fatal(format!("invalid panel base url: {err}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PanelError::Fatal(format!("http client init failed: {err}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    /// Reads the API key from the environment variable the config names.
    pub fn from_config(config: &PanelConfig) -> Result<Self, PanelError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PanelError::Fatal(format!("api key env var {} is not set", config.api_key_env))
        })?;
        Self::new(
            &config.base_url,
            &api_key,
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    fn server_url(&self, resource_id: &str, suffix: &str) -> Result<Url, PanelError> {
        let path = format!("api/client/servers/{resource_id}/{suffix}");
        self.base_url
            .join(path.trim_end_matches('/'))
            .map_err(|err| PanelError::Fatal(format!("invalid panel url: {err}")))
    }

    fn dispatch(&self, request: RequestBuilder) -> Result<Value, PanelError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json")
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    PanelError::Timeout
                } else {
                    PanelError::Transient(format!("request failed: {err}"))
                }
            })?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status.is_success() {
            // Power and command endpoints reply 204 with an empty body.
            if body.trim().is_empty() {
                return Ok(json!({}));
            }
            return serde_json::from_str(&body)
                .map_err(|err| PanelError::Fatal(format!("unparseable panel response: {err}")));
        }
        let detail = error_detail(&body).unwrap_or_else(|| format!("http status {status}"));
        tracing::debug!(status = status.as_u16(), %detail, "panel call failed");
        Err(classify_status(status, detail))
    }
}

fn classify_status(status: StatusCode, detail: String) -> PanelError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PanelError::Unauthorized,
        StatusCode::NOT_FOUND => PanelError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => PanelError::Transient(detail),
        status if status.is_server_error() => PanelError::Transient(detail),
        _ => PanelError::Fatal(detail),
    }
}

/// The panel wraps failures in `{"errors": [{"code", "status", "detail"}]}`.
fn error_detail(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let first = parsed["errors"].as_array()?.first()?;
    let detail = first["detail"].as_str()?;
    match first["code"].as_str() {
        Some(code) => Some(format!("{code}: {detail}")),
        None => Some(detail.to_string()),
    }
}

impl PanelApi for HttpPanelClient {
    fn list_servers(&self) -> Result<Value, PanelError> {
        let url = self
            .base_url
            .join("api/client")
            .map_err(|err| PanelError::Fatal(format!("invalid panel url: {err}")))?;
        self.dispatch(self.client.get(url))
    }

    fn power_action(&self, resource_id: &str, signal: PowerSignal) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "power")?;
        self.dispatch(
            self.client
                .post(url)
                .json(&json!({"signal": signal.as_str()})),
        )
    }

    fn send_command(&self, resource_id: &str, command: &str) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "command")?;
        self.dispatch(self.client.post(url).json(&json!({"command": command})))
    }

    fn resource_usage(&self, resource_id: &str) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "resources")?;
        self.dispatch(self.client.get(url))
    }

    fn read_file(&self, resource_id: &str, path: &str) -> Result<Value, PanelError> {
        let mut url = self.server_url(resource_id, "files/contents")?;
        url.query_pairs_mut().append_pair("file", path);
        self.dispatch(self.client.get(url))
    }

    fn write_file(
        &self,
        resource_id: &str,
        path: &str,
        content: &str,
    ) -> Result<Value, PanelError> {
        let mut url = self.server_url(resource_id, "files/write")?;
        url.query_pairs_mut().append_pair("file", path);
        self.dispatch(self.client.post(url).body(content.to_string()))
    }

    fn delete_files(&self, resource_id: &str, files: &[String]) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "files/delete")?;
        self.dispatch(
            self.client
                .post(url)
                .json(&json!({"root": "/", "files": files})),
        )
    }

    fn create_backup(&self, resource_id: &str, name: Option<&str>) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "backups")?;
        let payload = match name {
            Some(name) => json!({"name": name}),
            None => json!({}),
        };
        self.dispatch(self.client.post(url).json(&payload))
    }

    fn restore_backup(&self, resource_id: &str, backup_id: &str) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, &format!("backups/{backup_id}/restore"))?;
        self.dispatch(self.client.post(url).json(&json!({"truncate": false})))
    }

    fn create_database(&self, resource_id: &str, name: &str) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, "databases")?;
        self.dispatch(
            self.client
                .post(url)
                .json(&json!({"database": name, "remote": "%"})),
        )
    }

    fn delete_database(&self, resource_id: &str, database_id: &str) -> Result<Value, PanelError> {
        let url = self.server_url(resource_id, &format!("databases/{database_id}"))?;
        self.dispatch(self.client.delete(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_state_and_players() {
        let body = json!({
            "object": "stats",
            "attributes": {
                "current_state": "running",
                "players": {"online": 7, "max": 20}
            }
        });
        let snapshot = snapshot_from_usage(&body);
        assert_eq!(snapshot.state, ResourceState::Running);
        assert_eq!(snapshot.active_players, 7);
    }

    #[test]
    fn snapshot_degrades_on_malformed_body() {
        let snapshot = snapshot_from_usage(&json!({"unexpected": true}));
        assert_eq!(snapshot.state, ResourceState::Unknown);
        assert_eq!(snapshot.active_players, 0);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "x".into()),
            PanelError::Unauthorized
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "x".into()),
            PanelError::NotFound
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, "x".into()).retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x".into()).retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "x".into()).retryable());
    }

    #[test]
    fn error_detail_reads_the_panel_envelope() {
        let body = r#"{"errors":[{"code":"DaemonConnectionException","status":"502","detail":"node offline"}]}"#;
        assert_eq!(
            error_detail(body).as_deref(),
            Some("DaemonConnectionException: node offline")
        );
        assert_eq!(error_detail("not json"), None);
    }
}
