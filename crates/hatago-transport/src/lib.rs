//! Session manager, streaming HTTP/SSE and stdio transports, and the
//! subprocess supervisor (C5-C7).

pub mod error;
pub mod http;
pub mod security;
pub mod session;
pub mod stdio;
pub mod subprocess;

pub use error::{TransportError, TransportResult};
pub use http::{HandlerContext, HttpSessionTransport, HttpTransportConfig, McpHandler};
pub use security::{DnsRebindingGuardConfig, validate_request};
pub use session::{SessionManager, SessionManagerConfig, SessionRecord, SessionTransport};
pub use subprocess::{SubprocessConfig, SubprocessEvent, SubprocessState, SubprocessSupervisor};
