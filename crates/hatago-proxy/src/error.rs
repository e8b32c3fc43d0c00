//! Proxy-layer errors (§4.3/4.4/7: namespace conflicts, upstream failures).

use hatago_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("tool '{name}' excluded by include/exclude filter")]
    Excluded { name: String },

    #[error("tool name '{name}' conflicts with an existing mapping")]
    Conflict { name: String },

    #[error("tool '{name}' skipped due to a naming conflict")]
    Skipped { name: String },

    #[error("tool name '{name}' contains characters outside [A-Za-z0-9_:.-]")]
    InvalidName { name: String },

    #[error("tool name '{name}' exceeds the maximum length of {max}")]
    NameTooLong { name: String, max: usize },

    #[error("could not resolve a collision-free name for '{name}' after 100 attempts")]
    CollisionUnresolved { name: String },

    #[error("unknown upstream id: {id}")]
    UnknownUpstream { id: String },

    #[error("upstream '{id}' request failed: {message}")]
    Backend { id: String, message: String },

    #[error("upstream '{id}' request timed out")]
    Timeout { id: String },

    #[error("upstream '{id}' returned a malformed response: {message}")]
    MalformedResponse { id: String, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
