use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::app::AppState;

/// GET /health — liveness probe.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// GET /token-stats — rolling per-domain counters from the in-memory window.
pub async fn token_stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let domains: serde_json::Map<String, serde_json::Value> = state
        .metrics
        .all_domains()
        .into_iter()
        .map(|(domain, totals)| {
            (
                domain,
                serde_json::to_value(totals).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    Json(json!({
        "window_seconds": state.config.pool_window_seconds,
        "domains": domains,
    }))
}
