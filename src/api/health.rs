use axum::extract::State;
use axum::Json;

use super::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_status = match state.store.health_check().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(error = %err, "store health check failed");
            "down"
        }
    };
    Json(serde_json::json!({ "status": "ok", "store": store_status }))
}
