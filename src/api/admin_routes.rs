use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::hash_password;
use crate::domain::Client;
use crate::error::AppError;

use super::middleware::AdminAuth;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub machine_id: String,
    pub password: String,
    #[serde(default)]
    pub allowed_source_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientRequest {
    pub active: Option<bool>,
    pub allowed_source_ips: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ClientResponse {
    pub id: Uuid,
    pub machine_id: String,
    pub active: bool,
    pub allowed_source_ips: Vec<String>,
}

impl From<Client> for ClientResponse {
    fn from(c: Client) -> Self {
        ClientResponse {
            id: c.id,
            machine_id: c.machine_id,
            active: c.active,
            allowed_source_ips: c.allowed_source_ips,
        }
    }
}

pub async fn create_client(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<ClientResponse>), AppError> {
    let now = Utc::now();
    let client = Client {
        id: Uuid::new_v4(),
        machine_id: req.machine_id,
        password_hash: hash_password(&req.password)?,
        active: true,
        allowed_source_ips: req.allowed_source_ips,
        created_at: now,
        updated_at: now,
    };
    let created = state.store.create_client(client).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn update_client(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateClientRequest>,
) -> Result<Json<ClientResponse>, AppError> {
    let mut client = state.store.get_client(id).await?.ok_or(AppError::NotFound)?;
    if let Some(active) = req.active {
        client.active = active;
    }
    if let Some(ips) = req.allowed_source_ips {
        client.allowed_source_ips = ips;
    }
    client.updated_at = Utc::now();
    let updated = state.store.update_client(client).await?;
    Ok(Json(updated.into()))
}
