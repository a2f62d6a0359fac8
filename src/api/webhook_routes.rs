use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::domain::Hint;
use crate::error::AppError;
use crate::provider::http::verify_webhook_signature;

use super::AppState;

#[derive(Debug, Deserialize)]
struct ProviderWebhookPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "invoiceId")]
    invoice_id: String,
}

/// Provider notifications. The HMAC check runs over the untouched request
/// body — `Bytes` is extracted before any JSON parsing so the signature
/// always covers exactly what was sent.
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = headers
        .get("Provider-Sig")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    if !verify_webhook_signature(&state.settings.webhook_secret, &body, signature) {
        return Err(AppError::Unauthorized);
    }

    let payload: ProviderWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook payload: {e}")))?;

    let Some(payment) = state
        .store
        .find_payment_by_provider_invoice_id(&payload.invoice_id)
        .await?
    else {
        // Unknown invoice id: acknowledge without revealing whether it
        // ever existed.
        return Ok(Json(serde_json::json!({ "status": "ignored" })));
    };

    let mapped = state
        .settings
        .provider_event_map
        .get(&payload.event_type)
        .cloned();

    let hint = match mapped.as_deref() {
        Some("PAID") => Hint::Paid,
        Some("EXPIRED") => Hint::Expired,
        Some("INVALID") => Hint::Invalid,
        _ => {
            tracing::info!(event_type = %payload.event_type, "unmapped provider event type, logging only");
            return Ok(Json(serde_json::json!({ "status": "logged" })));
        }
    };

    let reason = format!("PROVIDER_WEBHOOK:{}", payload.event_type);
    state.engine.apply_hint(payment.id, hint, Some(reason)).await?;

    Ok(Json(serde_json::json!({ "status": "processed" })))
}
