use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::domain::CreatePaymentRequest;
use crate::error::AppError;

use super::middleware::AuthUser;
use super::AppState;

pub async fn create_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if !state.payment_rate_limiter.check(&auth.client_id.to_string()) {
        return Err(AppError::RateLimited);
    }

    let payment = state.engine.create(auth.client_id, req).await?;
    Ok((StatusCode::CREATED, Json(payment.to_observable_json())))
}

pub async fn get_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let payment = state.engine.get(auth.client_id, id).await?;
    Ok(Json(payment.to_observable_json()))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let payment = state.engine.cancel(auth.client_id, id).await?;
    Ok(Json(payment.to_observable_json()))
}
