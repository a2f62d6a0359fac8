pub mod api;
pub mod auth;
pub mod callback;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod provider;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
