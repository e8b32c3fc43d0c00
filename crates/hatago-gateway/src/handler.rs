//! Wires the three core-level JSON-RPC methods (§6: `initialize`,
//! `tools/list`, `tools/call`) to the plugin host and upstream registry
//! behind [`hatago_transport::McpHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use hatago_plugin::PluginHost;
use hatago_protocol::{
    InitializeResult, JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, ResponseId, ServerInfo, ToolDescriptor,
};
use hatago_proxy::UpstreamRegistry;
use hatago_transport::{HandlerContext, HttpSessionTransport, McpHandler};

const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct GatewayHandler {
    server_name: String,
    server_version: String,
    registry: Arc<UpstreamRegistry>,
    plugins: Arc<PluginHost<HttpSessionTransport>>,
}

impl GatewayHandler {
    pub fn new(
        server_name: impl Into<String>,
        server_version: impl Into<String>,
        registry: Arc<UpstreamRegistry>,
        plugins: Arc<PluginHost<HttpSessionTransport>>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_version: server_version.into(),
            registry,
            plugins,
        }
    }

    fn handle_initialize(&self) -> JsonRpcResponsePayload {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({ "tools": { "listChanged": false } }),
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: self.server_version.clone(),
            },
        };
        JsonRpcResponsePayload::Success {
            result: serde_json::to_value(result).expect("InitializeResult always serializes"),
        }
    }

    fn handle_tools_list(&self) -> JsonRpcResponsePayload {
        let mut tools: Vec<ToolDescriptor> = self
            .registry
            .all_mappings()
            .into_iter()
            .map(|mapping| ToolDescriptor {
                name: mapping.public_name,
                description: None,
                input_schema: serde_json::json!({ "type": "object" }),
            })
            .collect();
        tools.extend(self.plugins.local_tool_names().into_iter().map(|name| ToolDescriptor {
            name,
            description: None,
            input_schema: serde_json::json!({ "type": "object" }),
        }));
        JsonRpcResponsePayload::Success {
            result: serde_json::json!({ "tools": tools }),
        }
    }

    async fn handle_tools_call(&self, ctx: &HandlerContext, params: Option<serde_json::Value>) -> JsonRpcResponsePayload {
        let Some(params) = params else {
            return JsonRpcResponsePayload::Error {
                error: JsonRpcErrorCode::InvalidParams.into(),
            };
        };
        let Some(name) = params.get("name").and_then(serde_json::Value::as_str) else {
            return JsonRpcResponsePayload::Error {
                error: JsonRpcErrorCode::InvalidParams.into(),
            };
        };
        let arguments = params.get("arguments").cloned();
        self.plugins
            .dispatch_tool_call(&ctx.session_id, name, arguments)
            .await
    }
}

#[async_trait]
impl McpHandler for GatewayHandler {
    async fn handle(&self, request: JsonRpcRequest, ctx: HandlerContext) -> JsonRpcResponse {
        let payload = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(&ctx, request.params.clone()).await,
            _ => JsonRpcResponsePayload::Error {
                error: JsonRpcError {
                    code: JsonRpcErrorCode::MethodNotFound.code(),
                    message: format!("unknown method: {}", request.method),
                    data: None,
                },
            },
        };
        JsonRpcResponse {
            jsonrpc: Default::default(),
            payload,
            id: ResponseId::from_request(request.id),
        }
    }
}
