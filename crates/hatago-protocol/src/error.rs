//! Protocol-level errors: malformed frames and unsupported methods.
//!
//! Every other crate's error enum wraps this one (`#[from] ProtocolError`)
//! rather than re-deriving JSON-RPC error codes.

use crate::jsonrpc::{JsonRpcError, JsonRpcErrorCode};
use thiserror::Error;

/// Errors raised while parsing or dispatching a JSON-RPC frame.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Body did not parse as JSON, or parsed but was not a valid JSON-RPC frame.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Method name not among the core's supported set.
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// `params` present but shaped wrong for the method.
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
}

impl ProtocolError {
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// The stable JSON-RPC error code for this failure (§7).
    pub fn code(&self) -> JsonRpcErrorCode {
        match self {
            Self::Parse(_) => JsonRpcErrorCode::ParseError,
            Self::MethodNotFound { .. } => JsonRpcErrorCode::MethodNotFound,
            Self::InvalidParams { .. } => JsonRpcErrorCode::InvalidParams,
        }
    }
}

impl From<&ProtocolError> for JsonRpcError {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code().code(),
            message: err.to_string(),
            data: None,
        }
    }
}
