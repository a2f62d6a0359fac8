use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered kiosk. Created by an admin path; mutated only by admin;
/// never destroyed, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub machine_id: String,
    /// Argon2id PHC string; never the plaintext password.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub active: bool,
    /// Empty means "no restriction".
    pub allowed_source_ips: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn ip_allowed(&self, remote_ip: &str) -> bool {
        self.allowed_source_ips.is_empty()
            || self.allowed_source_ips.iter().any(|ip| ip == remote_ip)
    }
}
