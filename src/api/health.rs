use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "llm-extproc is running",
        "config": {
            "listen_addr": config.server.listen_addr,
            "stats_dir": config.server.stats_dir,
            "policies": config.policies.keys().collect::<Vec<_>>(),
            "compiled_policies": state.guardrail_cache().len(),
            "features": {
                "log_level": config.features.log_level,
                "min_guardrail_chars": config.features.min_guardrail_chars,
                "max_buffered_bytes": config.features.max_buffered_bytes,
                "buffer_overflow": config.features.buffer_overflow,
                "force_stream_usage": config.features.force_stream_usage,
                "max_metric_series": config.features.max_metric_series,
            }
        }
    }))
}
