use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Typed configuration loaded from the environment (with an optional
/// `.env` for local development). Mirrors the configuration table in the
/// external interfaces section: store/bus URLs, signing keys, provider
/// credentials, monitoring/poll windows, bind address, log level.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub log_level: String,

    /// Ed25519 signing key (PKCS8 PEM) used to mint kiosk bearer tokens.
    pub jwt_signing_key_path: String,
    /// Verifying keys accepted by [`crate::auth`]; keeping the previous
    /// key here lets operators rotate without invalidating live tokens.
    pub jwt_verifying_key_paths: Vec<String>,
    pub jwt_issuer: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,

    pub admin_token: String,

    pub provider_base_url: String,
    pub provider_api_key: String,
    pub provider_store_id: String,
    pub webhook_secret: String,
    /// Maps the provider's own event-type vocabulary to our hints; left
    /// configurable per the open question in the design notes.
    #[serde(default = "default_provider_event_map")]
    pub provider_event_map: HashMap<String, String>,

    #[serde(default = "default_monitoring_window_secs")]
    pub monitoring_window_secs: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_auth_rate_limit_per_min")]
    pub auth_rate_limit_per_min: u32,
    #[serde(default = "default_payment_rate_limit_per_min")]
    pub payment_rate_limit_per_min: u32,

    #[serde(default = "default_stream_queue_len")]
    pub stream_queue_len: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_token_ttl_secs() -> i64 {
    600
}
fn default_monitoring_window_secs() -> i64 {
    120
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_provider_timeout_secs() -> u64 {
    10
}
fn default_auth_rate_limit_per_min() -> u32 {
    5
}
fn default_payment_rate_limit_per_min() -> u32 {
    60
}
fn default_stream_queue_len() -> usize {
    64
}
fn default_keepalive_secs() -> u64 {
    15
}

fn default_provider_event_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("InvoiceSettled".to_string(), "PAID".to_string());
    m.insert("InvoiceExpired".to_string(), "EXPIRED".to_string());
    m.insert("InvoiceInvalid".to_string(), "INVALID".to_string());
    m
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("jwt_verifying_key_paths"),
            )
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        Ok(settings)
    }

    pub fn monitoring_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.monitoring_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_secs)
    }
}
