//! Transport-layer errors (§7: Session, Transport, Subprocess kinds).

use hatago_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("session capacity exceeded")]
    CapacityExceeded,

    #[error("losing side of a concurrent rotation")]
    RotationLost,

    #[error("bad request: {message}")]
    BadRequest { message: String },

    #[error("bad or missing session header")]
    BadSession,

    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request blocked by DNS-rebinding guard: {reason}")]
    DnsRebindingBlocked { reason: String },

    #[error("outbound queue size limit exceeded")]
    QueueSizeLimitExceeded,

    #[error("stream write failed: {0}")]
    StreamWriteFailed(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("requested event id is older than the retained replay window")]
    Truncated,

    #[error("failed to spawn subprocess: {0}")]
    SpawnFailed(String),

    #[error("subprocess exited unexpectedly: {0}")]
    ExitedUnexpectedly(String),

    #[error("subprocess restart limit reached ({max_restarts} restarts)")]
    RestartLimitReached { max_restarts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
