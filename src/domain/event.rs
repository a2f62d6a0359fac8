use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types carried on the per-client log and the live stream.
/// `Keepalive` is synthetic: it is never persisted and never carries a `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "payment.created")]
    PaymentCreated,
    #[serde(rename = "payment.invoice_created")]
    PaymentInvoiceCreated,
    #[serde(rename = "payment.status_changed")]
    PaymentStatusChanged,
    #[serde(rename = "payment.paid")]
    PaymentPaid,
    #[serde(rename = "payment.expired")]
    PaymentExpired,
    #[serde(rename = "payment.timed_out")]
    PaymentTimedOut,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "keepalive")]
    Keepalive,
}

impl EventType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            EventType::PaymentCreated => "payment.created",
            EventType::PaymentInvoiceCreated => "payment.invoice_created",
            EventType::PaymentStatusChanged => "payment.status_changed",
            EventType::PaymentPaid => "payment.paid",
            EventType::PaymentExpired => "payment.expired",
            EventType::PaymentTimedOut => "payment.timed_out",
            EventType::PaymentFailed => "payment.failed",
            EventType::Keepalive => "keepalive",
        }
    }

    pub fn is_persisted(&self) -> bool {
        !matches!(self, EventType::Keepalive)
    }
}

/// A single append-only log entry for a client. `seq` is dense and unique
/// per `client_id`, assigned in the same transaction as the status change
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub client_id: Uuid,
    pub seq: i64,
    pub event_type: EventType,
    pub payment_id: Uuid,
    pub emitted_at: DateTime<Utc>,
    /// Snapshot of the payment's observable state at emission time.
    pub payload: serde_json::Value,
}

/// What gets pushed through the event bus after a transaction commits.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedEvent {
    pub client_id: Uuid,
    pub seq: Option<i64>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl From<&PaymentEvent> for PublishedEvent {
    fn from(e: &PaymentEvent) -> Self {
        PublishedEvent {
            client_id: e.client_id,
            seq: Some(e.seq),
            event_type: e.event_type,
            payload: e.payload.clone(),
        }
    }
}
