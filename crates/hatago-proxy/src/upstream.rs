//! Upstream client (C4): JSON-RPC 2.0 over HTTP POST to `<endpoint>/mcp`
//! (§4.4), with the teacher's connection-pooled `reqwest::Client` approach.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use hatago_protocol::{JsonRpcRequest, JsonRpcResponsePayload, RequestId};

use crate::error::{ProxyError, ProxyResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Clone)]
pub enum UpstreamAuth {
    Bearer(SecretString),
    Basic { username: String, password: SecretString },
    Custom(Vec<(String, String)>),
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic {{ username: {username:?}, password: <redacted> }}"),
            Self::Custom(headers) => write!(f, "Custom({headers:?})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub id: String,
    pub endpoint: String,
    pub auth: Option<UpstreamAuthDebugFree>,
    pub timeout: Duration,
}

/// Wrapper so `UpstreamConfig` can derive `Debug` while `UpstreamAuth` holds
/// secrets that must never be logged.
#[derive(Clone)]
pub struct UpstreamAuthDebugFree(pub UpstreamAuth);

impl std::fmt::Debug for UpstreamAuthDebugFree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            endpoint: String::new(),
            auth: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The final reply to a `tools/call` (or any other) request: the terminal
/// `result`/`error` payload plus any `notifications/progress` messages
/// observed on an SSE response while waiting for it.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub payload: JsonRpcResponsePayload,
    pub progress: Vec<Value>,
}

/// One upstream MCP server reached over HTTP.
pub struct UpstreamClient {
    config: UpstreamConfig,
    client: reqwest::Client,
    next_id: AtomicI64,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ProxyError::Http)?;
        Ok(Self {
            config,
            client,
            next_id: AtomicI64::new(1),
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            None => builder,
            Some(wrapper) => match &wrapper.0 {
                UpstreamAuth::Bearer(token) => {
                    builder.header("Authorization", format!("Bearer {}", token.expose_secret()))
                }
                UpstreamAuth::Basic { username, password } => {
                    builder.basic_auth(username, Some(password.expose_secret()))
                }
                UpstreamAuth::Custom(headers) => {
                    let mut builder = builder;
                    for (key, value) in headers {
                        builder = builder.header(key, value);
                    }
                    builder
                }
            },
        }
    }

    /// Issue one JSON-RPC call and wait for its terminal result, accumulating
    /// any progress notifications observed on an `event-stream` response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> ProxyResult<UpstreamReply> {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(method, params, id);

        let url = format!("{}/mcp", self.config.endpoint.trim_end_matches('/'));
        let builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(&request);
        let builder = self.apply_auth(builder);

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ProxyError::Timeout {
                    id: self.config.id.clone(),
                }
            } else {
                ProxyError::Backend {
                    id: self.config.id.clone(),
                    message: err.to_string(),
                }
            }
        })?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.consume_event_stream(response).await
        } else {
            let body: Value = response.json().await.map_err(|err| ProxyError::MalformedResponse {
                id: self.config.id.clone(),
                message: err.to_string(),
            })?;
            let payload = self.payload_from_value(body)?;
            Ok(UpstreamReply {
                payload,
                progress: Vec::new(),
            })
        }
    }

    async fn consume_event_stream(&self, response: reqwest::Response) -> ProxyResult<UpstreamReply> {
        use futures::StreamExt;

        let mut progress = Vec::new();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ProxyError::Backend {
                id: self.config.id.clone(),
                message: err.to_string(),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let value: Value = match serde_json::from_str(data.trim()) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if value.get("method").and_then(Value::as_str) == Some("notifications/progress") {
                    progress.push(value);
                    continue;
                }
                let payload = self.payload_from_value(value)?;
                return Ok(UpstreamReply { payload, progress });
            }
        }

        Err(ProxyError::MalformedResponse {
            id: self.config.id.clone(),
            message: "event stream closed before a terminal response was seen".into(),
        })
    }

    fn payload_from_value(&self, value: Value) -> ProxyResult<JsonRpcResponsePayload> {
        if let Some(error) = value.get("error") {
            let error = serde_json::from_value(error.clone()).map_err(|err| ProxyError::MalformedResponse {
                id: self.config.id.clone(),
                message: err.to_string(),
            })?;
            return Ok(JsonRpcResponsePayload::Error { error });
        }
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        Ok(JsonRpcResponsePayload::Success { result })
    }

    /// A health check is defined as a successful `initialize` (§4.4).
    pub async fn health_check(&self, client_name: &str, client_version: &str) -> ProxyResult<()> {
        let params = serde_json::json!({
            "protocolVersion": "2025-06-18",
            "clientInfo": { "name": client_name, "version": client_version },
            "capabilities": {},
        });
        match self.call("initialize", Some(params)).await?.payload {
            JsonRpcResponsePayload::Success { .. } => Ok(()),
            JsonRpcResponsePayload::Error { error } => Err(ProxyError::Backend {
                id: self.config.id.clone(),
                message: error.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> UpstreamConfig {
        UpstreamConfig {
            id: "srv1".into(),
            endpoint,
            auth: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn json_response_is_parsed_as_a_success_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(config(server.uri())).unwrap();
        let reply = client.call("tools/list", None).await.unwrap();
        assert!(matches!(reply.payload, JsonRpcResponsePayload::Success { .. }));
        assert!(reply.progress.is_empty());
    }

    #[tokio::test]
    async fn event_stream_accumulates_progress_before_terminal_result() {
        let server = MockServer::start().await;
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"pct\":50}}\n\
                     data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n";
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(config(server.uri())).unwrap();
        let reply = client.call("tools/call", None).await.unwrap();
        assert_eq!(reply.progress.len(), 1);
        assert!(matches!(reply.payload, JsonRpcResponsePayload::Success { .. }));
    }

    #[tokio::test]
    async fn error_payload_round_trips_from_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1,
                        "error": {"code": -32601, "message": "Method not found"}
                    })),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(config(server.uri())).unwrap();
        let reply = client.call("missing/method", None).await.unwrap();
        match reply.payload {
            JsonRpcResponsePayload::Error { error } => assert_eq!(error.code, -32601),
            JsonRpcResponsePayload::Success { .. } => panic!("expected an error payload"),
        }
    }
}
