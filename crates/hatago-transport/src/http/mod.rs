//! Streaming HTTP/SSE transport (C7): single `/mcp` endpoint accepting
//! `POST` (JSON-RPC frame) and `GET` (server-to-client SSE stream), backed
//! by the session manager and the replay-capable event store.

pub mod event_store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};

use hatago_core::{RequestContext, SessionId};
use hatago_protocol::{JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};

use crate::error::TransportError;
use crate::security::{DnsRebindingGuardConfig, validate_request};
use crate::session::{SessionManager, SessionTransport};
use event_store::EventStore;

const SESSION_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// What C9's dispatcher looks like from the transport's point of view: given
/// a parsed request and the session/event handles it needs to relay
/// progress, produce the JSON-RPC response.
#[async_trait]
pub trait McpHandler: Send + Sync + 'static {
    async fn handle(&self, request: JsonRpcRequest, ctx: HandlerContext) -> JsonRpcResponse;
}

/// Everything a handler needs to process one request and relay progress
/// notifications back on the caller's SSE stream.
pub struct HandlerContext {
    pub session_id: SessionId,
    pub request_ctx: RequestContext,
    pub events: Arc<EventStore>,
}

impl HandlerContext {
    /// Relay a `notifications/progress` (or any other) event on the caller's stream.
    pub fn publish(&self, event_type: &str, data: serde_json::Value) {
        self.events
            .publish(self.session_id.as_str(), event_type, data.to_string());
    }
}

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    pub endpoint_path: String,
    pub keep_alive: Duration,
    pub max_message_size: usize,
    pub max_queue_size: usize,
    pub replay_buffer_size: usize,
    pub dns_guard: DnsRebindingGuardConfig,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint_path: "/mcp".to_string(),
            keep_alive: Duration::from_secs(30),
            max_message_size: 4 * 1024 * 1024,
            max_queue_size: 1024,
            replay_buffer_size: 1000,
            dns_guard: DnsRebindingGuardConfig::default(),
        }
    }
}

/// Closes a session's SSE registrations in the shared event store. Plugged
/// into [`SessionManager`] as the `SessionTransport` for this transport.
///
/// The session id is unknown at construction time (`SessionManager::create`
/// mints it), so it is filled in right after creation succeeds.
#[derive(Debug)]
pub struct HttpSessionTransport {
    events: Arc<EventStore>,
    session_id: parking_lot::Mutex<String>,
}

impl HttpSessionTransport {
    fn new(events: Arc<EventStore>) -> Self {
        Self {
            events,
            session_id: parking_lot::Mutex::new(String::new()),
        }
    }

    fn bind(&self, session_id: &SessionId) {
        *self.session_id.lock() = session_id.to_string();
    }
}

impl SessionTransport for HttpSessionTransport {
    fn close(&self) {
        self.events.close(&self.session_id.lock());
    }
}

struct AppState<H: McpHandler> {
    sessions: Arc<SessionManager<HttpSessionTransport>>,
    events: Arc<EventStore>,
    handler: Arc<H>,
    config: Arc<HttpTransportConfig>,
}

impl<H: McpHandler> Clone for AppState<H> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            events: Arc::clone(&self.events),
            handler: Arc::clone(&self.handler),
            config: Arc::clone(&self.config),
        }
    }
}

/// Build the axum router exposing the single `/mcp` endpoint.
pub fn router<H: McpHandler>(
    config: HttpTransportConfig,
    sessions: Arc<SessionManager<HttpSessionTransport>>,
    events: Arc<EventStore>,
    handler: Arc<H>,
) -> Router {
    let path = config.endpoint_path.clone();
    let state = AppState {
        sessions,
        events,
        handler,
        config: Arc::new(config),
    };

    Router::new()
        .route(
            &path,
            get(mcp_get::<H>).post(mcp_post::<H>).fallback(method_not_allowed),
        )
        .with_state(state)
}

/// Any method other than `GET`/`POST` on the MCP endpoint (§4.7 step 1).
async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        axum::Json(jsonrpc_error_body(JsonRpcErrorCode::MethodNotAllowed, "Method not allowed")),
    )
        .into_response()
}

fn jsonrpc_error_body(code: JsonRpcErrorCode, message: impl Into<String>) -> serde_json::Value {
    let error = JsonRpcError {
        code: code.code(),
        message: message.into(),
        data: None,
    };
    serde_json::json!({ "jsonrpc": "2.0", "id": null, "error": error })
}

fn validate_dns_guard<H: McpHandler>(
    state: &AppState<H>,
    headers: &HeaderMap,
    client_ip: SocketAddr,
) -> Result<(), Response> {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    validate_request(&state.config.dns_guard, host, origin, Some(client_ip.ip())).map_err(|err| {
        (
            StatusCode::FORBIDDEN,
            axum::Json(jsonrpc_error_body(
                JsonRpcErrorCode::InvalidRequest,
                err.to_string(),
            )),
        )
            .into_response()
    })
}

async fn mcp_get<H: McpHandler>(
    State(state): State<AppState<H>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = validate_dns_guard(&state, &headers, addr) {
        return response;
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !accept.contains("text/event-stream") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            axum::Json(jsonrpc_error_body(
                JsonRpcErrorCode::InvalidRequest,
                "Accept header must include text/event-stream",
            )),
        )
            .into_response();
    }

    let Some(session_id) = extract_session_id(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(jsonrpc_error_body(JsonRpcErrorCode::InvalidRequest, "missing mcp-session-id")),
        )
            .into_response();
    };
    if state.sessions.access(&session_id).is_err() {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(jsonrpc_error_body(JsonRpcErrorCode::InvalidRequest, "session not found")),
        )
            .into_response();
    }

    let last_event_id: Option<u64> = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let (replay, mut live) = match last_event_id {
        Some(id) => match state.events.replay_and_subscribe(session_id.as_str(), id) {
            Ok(result) => result,
            Err(TransportError::Truncated) => {
                return (
                    StatusCode::GONE,
                    axum::Json(jsonrpc_error_body(
                        JsonRpcErrorCode::InvalidRequest,
                        "replay window truncated; reconnect with a fresh session",
                    )),
                )
                    .into_response();
            }
            Err(_) => (Vec::new(), state.events.subscribe(session_id.as_str())),
        },
        None => (Vec::new(), state.events.subscribe(session_id.as_str())),
    };

    let keep_alive = state.config.keep_alive;

    let stream = async_stream::stream! {
        for event in replay {
            yield Ok::<Event, axum::Error>(
                Event::default().event(event.event_type).data(event.data).id(event.id.to_string()),
            );
        }
        while let Some(event) = live.recv().await {
            yield Ok(Event::default().event(event.event_type).data(event.data).id(event.id.to_string()));
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response()
}

async fn mcp_post<H: McpHandler>(
    State(state): State<AppState<H>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = validate_dns_guard(&state, &headers, addr) {
        return response;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            axum::Json(jsonrpc_error_body(
                JsonRpcErrorCode::InvalidRequest,
                "Content-Type must be application/json",
            )),
        )
            .into_response();
    }
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !(accept.contains("application/json") && accept.contains("text/event-stream")) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            axum::Json(jsonrpc_error_body(
                JsonRpcErrorCode::InvalidRequest,
                "Accept header must include application/json and text/event-stream",
            )),
        )
            .into_response();
    }

    if body.len() > state.config.max_message_size {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            axum::Json(jsonrpc_error_body(
                JsonRpcErrorCode::InvalidRequest,
                format!(
                    "message of {} bytes exceeds the {} byte limit",
                    body.len(),
                    state.config.max_message_size
                ),
            )),
        )
            .into_response();
    }

    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(jsonrpc_error_body(JsonRpcErrorCode::ParseError, err.to_string())),
            )
                .into_response();
        }
    };

    let JsonRpcMessage::Request(request) = message else {
        // Notifications and responses from the client require no reply (§6).
        return StatusCode::ACCEPTED.into_response();
    };

    let existing_session = extract_session_id(&headers);
    let session_id = if request.method == "initialize" && existing_session.is_none() {
        let transport = Arc::new(HttpSessionTransport::new(Arc::clone(&state.events)));
        match state.sessions.create(Arc::clone(&transport)) {
            Ok(id) => {
                transport.bind(&id);
                id
            }
            Err(_) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    axum::Json(jsonrpc_error_body(
                        JsonRpcErrorCode::InternalError,
                        "session capacity exceeded",
                    )),
                )
                    .into_response();
            }
        }
    } else {
        match existing_session {
            Some(id) if state.sessions.access(&id).is_ok() => id,
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(jsonrpc_error_body(
                        JsonRpcErrorCode::InvalidRequest,
                        "missing or unknown mcp-session-id",
                    )),
                )
                    .into_response();
            }
        }
    };

    let ctx = HandlerContext {
        session_id: session_id.clone(),
        request_ctx: RequestContext::new(request.id.to_string(), Some(session_id.clone())),
        events: Arc::clone(&state.events),
    };

    let response = state.handler.handle(request, ctx).await;
    let body = serde_json::to_string(&response).unwrap_or_default();
    let sse_body = format!("event: message\ndata: {body}\n\n");

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::HeaderName::from_static(SESSION_HEADER), session_id.as_str()),
        ],
        sse_body,
    )
        .into_response()
}

fn extract_session_id(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| SessionId::parse(v).ok())
}
