use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;

use super::AppState;

/// Extracted from a verified bearer token; attached to the request so
/// handlers never re-derive the caller's identity.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub client_id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(AppError::Unauthorized)?;

        let claims = state.auth.verify_token(token)?;
        let client = state
            .store
            .get_client(claims.sub)
            .await?
            .ok_or(AppError::Unauthorized)?;
        if !client.active {
            return Err(AppError::Forbidden);
        }

        Ok(AuthUser { client_id: client.id })
    }
}

/// Marker extractor for the separate admin bearer secret used by the
/// `/admin/*` surface. Never accepts a kiosk token.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(AppError::Unauthorized)?;

        if constant_time_eq(token.as_bytes(), state.settings.admin_token.as_bytes()) {
            Ok(AdminAuth)
        } else {
            Err(AppError::Unauthorized)
        }
    }
}

/// The remote IP as seen by axum's `ConnectInfo`, used for the auth
/// rate limiter and the source-IP allow-list check. Behind a real
/// reverse proxy this would instead read a trusted `X-Forwarded-For`.
pub struct RemoteIp(pub String);

impl FromRequestParts<AppState> for RemoteIp {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ConnectInfo(addr) = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("missing connection info")))?;
        Ok(RemoteIp(addr.ip().to_string()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
