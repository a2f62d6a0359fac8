pub mod admin_routes;
pub mod auth_routes;
pub mod health;
pub mod middleware;
pub mod payment_routes;
pub mod stream_routes;
pub mod webhook_routes;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::config::Settings;
use crate::events::EventBus;
use crate::lifecycle::LifecycleEngine;
use crate::rate_limit::KeyedRateLimiter;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<LifecycleEngine>,
    pub bus: EventBus,
    pub auth: Arc<AuthService>,
    pub settings: Arc<Settings>,
    pub auth_rate_limiter: KeyedRateLimiter,
    pub payment_rate_limiter: KeyedRateLimiter,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/auth/token", post(auth_routes::issue_token))
        .route("/api/v1/payments", post(payment_routes::create_payment))
        .route("/api/v1/payments/:id", get(payment_routes::get_payment))
        .route(
            "/api/v1/payments/:id/cancel",
            post(payment_routes::cancel_payment),
        )
        .route("/api/v1/events/stream", get(stream_routes::stream_events))
        .route(
            "/api/v1/webhooks/provider",
            post(webhook_routes::provider_webhook),
        )
        .route("/api/v1/admin/clients", post(admin_routes::create_client))
        .route("/api/v1/admin/clients/:id", patch(admin_routes::update_client))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
