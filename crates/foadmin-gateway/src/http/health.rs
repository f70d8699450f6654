use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with scheduler status.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.scheduler.registry();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler": {
            "running": registry.is_running(),
            "timezone": registry.timezone().name(),
            "jobs": registry.len(),
        },
    }))
}
