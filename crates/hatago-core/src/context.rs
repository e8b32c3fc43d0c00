//! Per-request context. Carries cancellation, the owning session, and
//! request metadata across every nested fan-out (upstream call, plugin
//! invocation) so a single cancellation propagates everywhere (§5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::session_id::SessionId;

/// Context threaded through every call path instead of relying on global state.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub session_id: Option<SessionId>,
    pub start_time: Instant,
    pub metadata: Arc<HashMap<String, serde_json::Value>>,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            request_id: request_id.into(),
            session_id,
            start_time: Instant::now(),
            metadata: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// A context whose cancellation is a child of `self`'s: cancelling the
    /// parent (e.g. the whole session, or the gateway) cancels every child
    /// derived for an upstream fan-out.
    pub fn child(&self, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            session_id: self.session_id.clone(),
            start_time: Instant::now(),
            metadata: Arc::clone(&self.metadata),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// A context derived from `self` that also fires after `timeout`,
    /// without requiring the caller to race a `tokio::time::timeout` by hand.
    pub fn with_timeout(&self, timeout: std::time::Duration) -> Self {
        let child = self.child(self.request_id.clone());
        let token = child.cancellation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = RequestContext::new("r1", None);
        let child = parent.child("r1.1");
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let parent = RequestContext::new("r1", None);
        let child = parent.child("r1.1");
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
