//! MCP-level payload shapes carried inside JSON-RPC `params`/`result` bodies.
//!
//! Only the subset the core speaks (§6): `initialize`, `tools/list`, `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `clientInfo` sent by the peer in `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// `serverInfo` this gateway reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// `initialize` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// A tool as presented to the client in a `tools/list` response, after
/// namespace mapping has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_round_trip() {
        let params = InitializeParams {
            protocol_version: "2025-06-18".into(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: "t".into(),
                version: "1".into(),
            },
        };
        let encoded = serde_json::to_string(&params).unwrap();
        let decoded: InitializeParams = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.protocol_version, "2025-06-18");
        assert_eq!(decoded.client_info.name, "t");
    }
}
