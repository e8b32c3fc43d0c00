//! Shared primitives owned by the gateway core: session identifiers, the
//! per-request context that carries cancellation across nested fan-outs, and
//! the plugin host's pure state machine.

pub mod context;
pub mod host_state;
pub mod session_id;

pub use context::RequestContext;
pub use host_state::{HostEffect, HostEvent, HostState};
pub use session_id::SessionId;
