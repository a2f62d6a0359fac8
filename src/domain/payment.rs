use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle states. Transitions are validated exclusively by
/// [`crate::lifecycle::LifecycleEngine`]; nothing else is allowed to write
/// `status` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Created,
    Pending,
    Paid,
    Expired,
    TimedOut,
    Failed,
    Canceled,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Created => "CREATED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::TimedOut => "TIMED_OUT",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(PaymentStatus::Created),
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            "TIMED_OUT" => Ok(PaymentStatus::TimedOut),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELED" => Ok(PaymentStatus::Canceled),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown payment status in storage: {other}"
            ))),
        }
    }
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Paid
                | PaymentStatus::Expired
                | PaymentStatus::TimedOut
                | PaymentStatus::Failed
                | PaymentStatus::Canceled
        )
    }

    /// The allowed-transition partial order from the lifecycle spec.
    /// `CREATED -> PAID` is deliberately absent: see DESIGN.md for the
    /// lock-and-reload resolution of that race.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (*self, next) {
            (Created, Pending) => true,
            (Created, Failed) | (Created, Canceled) => true,
            (Pending, Paid)
            | (Pending, Expired)
            | (Pending, TimedOut)
            | (Pending, Failed)
            | (Pending, Canceled) => true,
            _ => false,
        }
    }
}

/// Advisory transition request submitted to the engine by the webhook
/// ingress or the monitoring worker. May be accepted or silently rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Paid,
    Expired,
    Invalid,
    StillPending,
    TimedOut,
}

impl Hint {
    pub fn target_status(&self) -> Option<PaymentStatus> {
        match self {
            Hint::Paid => Some(PaymentStatus::Paid),
            Hint::Expired => Some(PaymentStatus::Expired),
            Hint::Invalid => Some(PaymentStatus::Failed),
            Hint::TimedOut => Some(PaymentStatus::TimedOut),
            Hint::StillPending => None,
        }
    }

    pub fn event_type(&self) -> Option<crate::domain::EventType> {
        use crate::domain::EventType;
        match self {
            Hint::Paid => Some(EventType::PaymentPaid),
            Hint::Expired => Some(EventType::PaymentExpired),
            Hint::Invalid => Some(EventType::PaymentFailed),
            Hint::TimedOut => Some(EventType::PaymentTimedOut),
            Hint::StillPending => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub provider: String,
    pub provider_invoice_id: String,
    pub checkout_link: String,
    pub bolt11: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub client_id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub external_code: String,
    pub description: Option<String>,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub invoice: Option<Invoice>,
    pub monitor_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub idempotency_key: Option<String>,
}

impl PaymentRequest {
    /// JSON snapshot of observable state, used both as the event payload
    /// and as the wire response body.
    pub fn to_observable_json(&self) -> serde_json::Value {
        serde_json::json!({
            "payment_id": self.id,
            "status": self.status,
            "monitor_until": self.monitor_until,
            "invoice": self.invoice,
            "amount": { "amount": self.amount, "currency": self.currency },
            "metadata": self.metadata,
            "external_code": self.external_code,
            "created_at": self.created_at,
            "finalized_at": self.finalized_at,
            "status_reason": self.status_reason,
        })
    }
}

/// Inbound create-payment request body, pre-validation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentRequest {
    pub payment_method: String,
    pub amount: Decimal,
    pub currency: String,
    pub external_code: String,
    pub description: Option<String>,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

/// The fields compared when a retried create reuses an idempotency key.
/// Two requests with the same key must match on all of these or the
/// retry is rejected with 409.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyFingerprint {
    pub amount: String,
    pub currency: String,
    pub external_code: String,
    pub payment_method: String,
    pub metadata: Option<serde_json::Value>,
}

impl CreatePaymentRequest {
    const MAX_METADATA_BYTES: usize = 8 * 1024;
    const MIN_CURRENCY_LEN: usize = 3;
    const MAX_CURRENCY_LEN: usize = 10;
    const MAX_EXTERNAL_CODE_LEN: usize = 64;

    pub fn validate(&self) -> Result<(), AppError> {
        if self.payment_method != "BTC_LN" {
            return Err(AppError::BadRequest(format!(
                "unsupported payment_method: {}",
                self.payment_method
            )));
        }
        if self.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest("amount must be > 0".into()));
        }
        if !(Self::MIN_CURRENCY_LEN..=Self::MAX_CURRENCY_LEN).contains(&self.currency.len()) {
            return Err(AppError::BadRequest(format!(
                "currency must be {}-{} chars",
                Self::MIN_CURRENCY_LEN,
                Self::MAX_CURRENCY_LEN
            )));
        }
        if self.external_code.is_empty() || self.external_code.len() > Self::MAX_EXTERNAL_CODE_LEN
        {
            return Err(AppError::BadRequest(format!(
                "external_code must be 1-{} chars",
                Self::MAX_EXTERNAL_CODE_LEN
            )));
        }
        for (name, url) in [
            ("callback_url", &self.callback_url),
            ("redirect_url", &self.redirect_url),
        ] {
            if let Some(u) = url {
                if url::Url::parse(u).is_err() {
                    return Err(AppError::BadRequest(format!("{name} is not a valid URL")));
                }
            }
        }
        if let Some(meta) = &self.metadata {
            let size = serde_json::to_vec(meta).map(|v| v.len()).unwrap_or(0);
            if size > Self::MAX_METADATA_BYTES {
                return Err(AppError::BadRequest(format!(
                    "metadata exceeds {} bytes",
                    Self::MAX_METADATA_BYTES
                )));
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> IdempotencyFingerprint {
        IdempotencyFingerprint {
            amount: self.amount.normalize().to_string(),
            currency: self.currency.clone(),
            external_code: self.external_code.clone(),
            payment_method: self.payment_method.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn valid_request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            payment_method: "BTC_LN".to_string(),
            amount: Decimal::new(1000, 2),
            currency: "USD".to_string(),
            external_code: "order-42".to_string(),
            description: None,
            callback_url: Some("https://kiosk.example.com/cb".to_string()),
            redirect_url: None,
            metadata: None,
            idempotency_key: Some("key-1".to_string()),
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_request() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_lightning_payment_method() {
        let mut req = valid_request();
        req.payment_method = "CARD".to_string();
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn validate_rejects_non_positive_amount() {
        let mut req = valid_request();
        req.amount = Decimal::ZERO;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_callback_url() {
        let mut req = valid_request();
        req.callback_url = Some("not a url".to_string());
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_metadata() {
        let mut req = valid_request();
        let big = "x".repeat(9 * 1024);
        req.metadata = Some(serde_json::json!({ "blob": big }));
        assert!(req.validate().is_err());
    }

    #[test]
    fn fingerprint_is_stable_under_amount_formatting() {
        let mut a = valid_request();
        let mut b = valid_request();
        a.amount = Decimal::from_str("10.00").unwrap();
        b.amount = Decimal::from_str("10.0").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_external_code() {
        let a = valid_request();
        let mut b = valid_request();
        b.external_code = "order-43".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn status_round_trips_through_its_wire_representation() {
        for status in [
            PaymentStatus::Created,
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Expired,
            PaymentStatus::TimedOut,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<PaymentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn created_cannot_jump_directly_to_paid() {
        assert!(!PaymentStatus::Created.can_transition_to(PaymentStatus::Paid));
    }

    #[test]
    fn pending_can_reach_every_terminal_state() {
        for target in [
            PaymentStatus::Paid,
            PaymentStatus::Expired,
            PaymentStatus::TimedOut,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
        ] {
            assert!(PaymentStatus::Pending.can_transition_to(target));
        }
    }

    #[test]
    fn terminal_states_accept_no_further_transition() {
        assert!(!PaymentStatus::Paid.can_transition_to(PaymentStatus::Canceled));
        assert!(PaymentStatus::Paid.is_terminal());
    }
}
