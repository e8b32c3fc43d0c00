//! Standard-stream transport: line-delimited JSON-RPC over stdin/stdout.
//!
//! The core spec treats stdio as a one-session degenerate case of C7 — there
//! is exactly one caller, so there is no session header and no replay
//! buffer, but progress notifications still need somewhere to go. They are
//! written as ordinary JSON-RPC notification lines interleaved with
//! responses. All diagnostic logging goes to stderr; stdout carries only
//! JSON-RPC frames.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use hatago_core::{RequestContext, SessionId};
use hatago_protocol::{JsonRpcMessage, JsonRpcNotification};

use crate::error::{TransportError, TransportResult};
use crate::http::HandlerContext;
use crate::http::event_store::EventStore;
use crate::http::McpHandler;

#[derive(Clone, Debug)]
pub struct StdioTransportConfig {
    pub max_message_size: usize,
}

impl Default for StdioTransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

/// Run the stdio transport to completion (until stdin closes). `session_id`
/// is the transport's single, fixed session — generated once by the caller.
pub async fn serve<H, R, W>(
    config: StdioTransportConfig,
    handler: Arc<H>,
    session_id: SessionId,
    reader: R,
    writer: W,
) -> TransportResult<()>
where
    H: McpHandler,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let events = Arc::new(EventStore::new(1));
    let mut progress = events.subscribe(session_id.as_str());

    let mut lines = FramedRead::new(BufReader::new(reader), LinesCodec::new());
    let mut out = FramedWrite::new(writer, LinesCodec::new());
    let ctx = RequestContext::new(format!("stdio:{}", session_id.redacted()), Some(session_id.clone()));

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    tracing::debug!("stdio transport: stdin closed");
                    return Ok(());
                };
                let line = line.map_err(|err| TransportError::StreamWriteFailed(err.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                if line.len() > config.max_message_size {
                    tracing::warn!(size = line.len(), "stdio message exceeds max_message_size, dropping");
                    continue;
                }

                let message: JsonRpcMessage = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to parse stdio JSON-RPC frame");
                        continue;
                    }
                };

                let JsonRpcMessage::Request(request) = message else {
                    continue;
                };

                let handler_ctx = HandlerContext {
                    session_id: session_id.clone(),
                    request_ctx: ctx.child(request.id.to_string()),
                    events: Arc::clone(&events),
                };
                let response = handler.handle(request, handler_ctx).await;
                let encoded = serde_json::to_string(&response)
                    .map_err(|err| TransportError::StreamWriteFailed(err.to_string()))?;
                out.send(encoded)
                    .await
                    .map_err(|err| TransportError::StreamWriteFailed(err.to_string()))?;
            }
            event = progress.recv() => {
                let Some(event) = event else { continue };
                let notification = JsonRpcNotification::new(event.event_type, serde_json::from_str(&event.data).ok());
                if let Ok(encoded) = serde_json::to_string(&notification) {
                    let _ = out.send(encoded).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hatago_protocol::{JsonRpcRequest, JsonRpcResponse};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    struct EchoHandler;

    #[async_trait]
    impl McpHandler for EchoHandler {
        async fn handle(&self, request: JsonRpcRequest, _ctx: HandlerContext) -> JsonRpcResponse {
            JsonRpcResponse::success(request.id, serde_json::json!({"echo": true}))
        }
    }

    #[tokio::test]
    async fn request_line_produces_a_response_line() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let session_id = SessionId::generate();
        let serve_task = tokio::spawn(serve(
            StdioTransportConfig::default(),
            Arc::new(EchoHandler),
            session_id,
            server_read,
            server_write,
        ));

        let request = JsonRpcRequest::new("ping", None, 1.into());
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        client_write.write_all(line.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client_read.read(&mut buf).await.unwrap();
        let received = String::from_utf8_lossy(&buf[..n]);
        assert!(received.contains("\"echo\":true"));

        drop(client_write);
        let _ = serve_task.await;
    }
}
