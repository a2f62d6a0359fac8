use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::verify_password;
use crate::error::AppError;

use super::middleware::RemoteIp;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub machine_id: String,
    pub password: String,
    #[allow(dead_code)]
    pub nonce: Option<String>,
    #[allow(dead_code)]
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

pub async fn issue_token(
    State(state): State<AppState>,
    RemoteIp(remote_ip): RemoteIp,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    if !state.auth_rate_limiter.check(&remote_ip) {
        return Err(AppError::RateLimited);
    }

    let client = state
        .store
        .get_client_by_machine_id(&req.machine_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !client.active || !client.ip_allowed(&remote_ip) {
        return Err(AppError::Forbidden);
    }

    if !verify_password(&req.password, &client.password_hash) {
        return Err(AppError::Unauthorized);
    }

    let (access_token, expires_in) = state.auth.issue_token(client.id)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        expires_in,
    }))
}
