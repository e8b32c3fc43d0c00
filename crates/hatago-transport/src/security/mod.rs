//! DNS-rebinding guard for the streaming HTTP transport.

pub mod origin;

pub use origin::{DnsRebindingGuardConfig, validate_request};
