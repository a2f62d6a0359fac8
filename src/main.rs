use std::net::SocketAddr;
use std::sync::Arc;

use ln_payment_orchestrator::config::Settings;
use ln_payment_orchestrator::events::EventBus;
use ln_payment_orchestrator::provider::HttpProviderAdapter;
use ln_payment_orchestrator::rate_limit::KeyedRateLimiter;
use ln_payment_orchestrator::store::{PgStore, Store};
use ln_payment_orchestrator::{api, auth, callback, lifecycle, provider, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init(&settings.log_level);

    let store: Arc<dyn Store> = {
        let pg = PgStore::connect(&settings.database_url).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };
    store.health_check().await?;

    let encoding_key = auth::load_encoding_key(&settings.jwt_signing_key_path)?;
    let decoding_keys = settings
        .jwt_verifying_key_paths
        .iter()
        .map(|p| auth::load_decoding_key(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let auth_service = Arc::new(auth::AuthService::new(
        encoding_key,
        decoding_keys,
        settings.jwt_issuer.clone(),
        settings.token_ttl(),
    ));

    let provider_adapter: Arc<dyn provider::ProviderAdapter> = Arc::new(HttpProviderAdapter::new(
        settings.provider_base_url.clone(),
        settings.provider_api_key.clone(),
        settings.provider_store_id.clone(),
        settings.provider_timeout(),
    )?);

    let callback_notifier = Arc::new(callback::CallbackNotifier::new(settings.provider_timeout())?);
    let bus = EventBus::new(settings.stream_queue_len);
    let settings = Arc::new(settings);

    let engine = lifecycle::LifecycleEngine::build(
        store.clone(),
        bus.clone(),
        provider_adapter,
        settings.clone(),
        callback_notifier,
    );

    engine.monitor().sweep().await?;

    let state = api::AppState {
        store,
        engine,
        bus,
        auth: auth_service,
        auth_rate_limiter: KeyedRateLimiter::per_minute(settings.auth_rate_limit_per_min),
        payment_rate_limiter: KeyedRateLimiter::per_minute(settings.payment_rate_limit_per_min),
        settings: settings.clone(),
    };

    let shutdown_token = state.engine.monitor().shutdown_token();
    let app = api::router(state);
    let bind_addr = settings.bind_addr;

    tracing::info!(%bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
    })
    .await?;

    Ok(())
}
