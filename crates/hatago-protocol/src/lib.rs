//! JSON-RPC 2.0 framing and MCP wire types used by every Hatago crate.

pub mod error;
pub mod jsonrpc;
pub mod mcp;

pub use error::ProtocolError;
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, RequestId, ResponseId,
    JSONRPC_VERSION,
};
pub use mcp::{ClientInfo, InitializeParams, InitializeResult, ServerInfo, ToolDescriptor};
