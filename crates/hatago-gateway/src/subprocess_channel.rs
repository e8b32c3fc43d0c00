//! Adapts a subprocess supervisor's line-delimited stdio (C5) onto the
//! [`UpstreamChannel`] trait (C3/C4), so a spawned upstream dispatches
//! `tools/call` the same way an HTTP upstream does.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use hatago_protocol::JsonRpcResponsePayload;
use hatago_proxy::{ProxyError, ProxyResult, UpstreamChannel, UpstreamReply, tool_names_from_list_result};
use hatago_transport::{SubprocessConfig, SubprocessSupervisor};

/// Routes responses back to the caller awaiting a given request id. The
/// reader task below is the sole writer; callers only ever remove.
type Pending = Arc<DashMap<i64, oneshot::Sender<Value>>>;

pub struct SubprocessChannel {
    id: String,
    supervisor: Arc<SubprocessSupervisor>,
    pending: Pending,
    next_id: AtomicI64,
}

impl SubprocessChannel {
    /// Start the supervisor and spawn the reader task that demultiplexes
    /// stdout lines onto pending requests by JSON-RPC `id`.
    pub async fn start(id: impl Into<String>, config: SubprocessConfig) -> ProxyResult<Arc<Self>> {
        let id = id.into();
        let supervisor = SubprocessSupervisor::new(config);
        supervisor.start().await.map_err(|err| ProxyError::Backend {
            id: id.clone(),
            message: err.to_string(),
        })?;

        let mut stdout = supervisor
            .take_stdout()
            .await
            .expect("stdout receiver taken exactly once at startup");
        let pending: Pending = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(line) = stdout.recv().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let Some(request_id) = value.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                if let Some((_, tx)) = reader_pending.remove(&request_id) {
                    let _ = tx.send(value);
                }
            }
        });

        Ok(Arc::new(Self {
            id,
            supervisor,
            pending,
            next_id: AtomicI64::new(1),
        }))
    }

    pub fn supervisor(&self) -> &Arc<SubprocessSupervisor> {
        &self.supervisor
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await.ok();
    }
}

fn payload_from_value(value: Value) -> JsonRpcResponsePayload {
    if let Some(error) = value.get("error").cloned() {
        if let Ok(error) = serde_json::from_value(error) {
            return JsonRpcResponsePayload::Error { error };
        }
    }
    JsonRpcResponsePayload::Success {
        result: value.get("result").cloned().unwrap_or(Value::Null),
    }
}

#[async_trait]
impl UpstreamChannel for SubprocessChannel {
    async fn call_raw(&self, method: &str, params: Option<Value>) -> ProxyResult<UpstreamReply> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": request_id,
        });
        if let Err(err) = self.supervisor.send_line(&request.to_string()).await {
            self.pending.remove(&request_id);
            return Err(ProxyError::Backend {
                id: self.id.clone(),
                message: err.to_string(),
            });
        }

        let value = rx.await.map_err(|_| ProxyError::Backend {
            id: self.id.clone(),
            message: "subprocess closed before responding".to_string(),
        })?;

        Ok(UpstreamReply {
            payload: payload_from_value(value),
            progress: Vec::new(),
        })
    }

    async fn list_tool_names(&self) -> ProxyResult<Vec<String>> {
        let reply = self.call_raw("tools/list", None).await?;
        tool_names_from_list_result(reply.payload)
    }
}

/// Build the config the supervisor spawns from (§4.5); the supervisor itself
/// adds the `HATAGO_GATEWAY`/`HATAGO_SERVER_ID` marker env vars on top.
pub fn subprocess_config(
    server_id: &str,
    command: String,
    args: Vec<String>,
    working_directory: Option<String>,
    environment: Vec<(String, String)>,
    graceful_timeout: std::time::Duration,
    restart_on_failure: bool,
    max_restarts: u32,
) -> SubprocessConfig {
    SubprocessConfig {
        server_id: server_id.to_string(),
        command,
        args,
        working_directory,
        environment,
        graceful_timeout,
        restart_on_failure,
        max_restarts,
        ..Default::default()
    }
}
