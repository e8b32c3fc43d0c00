//! Health/readiness/startup/drain endpoints (§6, SUPPLEMENTED FEATURES):
//! named but not detailed by the core spec; implemented here as plain `axum`
//! handlers gated on the orchestrator's draining flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

/// Shared process-lifetime state the health handlers read.
pub struct HealthState {
    started_at: Instant,
    draining: AtomicBool,
    ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            draining: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        })
    }

    /// Flip once startup (enumeration, transport bind) has completed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Enter draining mode; idempotent (§6 `POST /drain`).
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_draining()
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/health/startup", get(startup))
        .route("/drain", post(drain))
        .with_state(state)
}

async fn live(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "pass",
        "uptime": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn ready(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> Json<serde_json::Value> {
    let is_ready = state.is_ready();
    Json(json!({
        "status": if is_ready { "pass" } else { "fail" },
        "checks": {
            "draining": state.is_draining(),
        },
    }))
}

async fn startup(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "pass",
        "initialized": state.is_ready() || !state.is_draining(),
    }))
}

async fn drain(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> Json<serde_json::Value> {
    state.mark_draining();
    Json(json!({ "status": "draining" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_not_ready_and_not_draining() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        assert!(!state.is_draining());
    }

    #[test]
    fn mark_ready_then_draining_flips_readiness_back_off() {
        let state = HealthState::new();
        state.mark_ready();
        assert!(state.is_ready());
        state.mark_draining();
        assert!(!state.is_ready());
        assert!(state.is_draining());
    }

    #[test]
    fn mark_draining_is_idempotent() {
        let state = HealthState::new();
        state.mark_draining();
        state.mark_draining();
        assert!(state.is_draining());
    }
}
