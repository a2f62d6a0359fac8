pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Client, Hint, IdempotencyFingerprint, Invoice, PaymentEvent, PaymentRequest};
use crate::error::StoreError;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Result of applying a hint under the payment's row lock: either the
/// transition was accepted (and persisted with its event), or it was a
/// silent no-op per the monotonicity rule, in which case the caller gets
/// the payment's current (unchanged) row back for logging.
pub enum TransitionOutcome {
    Accepted(PaymentRequest, PaymentEvent),
    Rejected(PaymentRequest),
}

/// Abstract transactional store: clients, payment requests, and the
/// per-client event log. A `Store` implementation owns all invariants
/// from the data model section — contiguous per-client `seq`, exactly one
/// event per transition, unique idempotency keys.
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // --- clients -----------------------------------------------------
    async fn create_client(&self, client: Client) -> Result<Client, StoreError>;
    async fn get_client_by_machine_id(&self, machine_id: &str) -> Result<Option<Client>, StoreError>;
    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, StoreError>;
    async fn update_client(&self, client: Client) -> Result<Client, StoreError>;

    // --- idempotency ---------------------------------------------------
    /// Looks up an existing create by `(client_id, idempotency_key)`.
    async fn find_idempotent_payment(
        &self,
        client_id: Uuid,
        key: &str,
    ) -> Result<Option<(Uuid, IdempotencyFingerprint)>, StoreError>;

    // --- payments ------------------------------------------------------
    /// Inserts a new `CREATED` row plus its first event (`payment.created`)
    /// in one transaction, optionally reserving the idempotency mapping.
    async fn insert_created_payment(
        &self,
        payment: PaymentRequest,
        fingerprint: Option<IdempotencyFingerprint>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError>;

    async fn get_payment(&self, id: Uuid) -> Result<Option<PaymentRequest>, StoreError>;

    async fn get_payment_owned(
        &self,
        client_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PaymentRequest>, StoreError>;

    /// Used by the webhook ingress to map a provider invoice id back to
    /// the owning payment without leaking existence through the response.
    async fn find_payment_by_provider_invoice_id(
        &self,
        provider_invoice_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError>;

    /// Attaches the invoice sub-record and transitions `CREATED -> PENDING`
    /// atomically with its event. Invoice is immutable once set; calling
    /// this twice on the same payment is a logic error in the engine, not
    /// something this method needs to guard defensively against.
    async fn attach_invoice(
        &self,
        payment_id: Uuid,
        invoice: Invoice,
        monitor_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError>;

    /// Evaluates and, if allowed, applies a hint under the payment's row
    /// lock: reload, check `can_transition_to`, persist + append event in
    /// the same transaction. Returns `Rejected` (not an error) for
    /// disallowed/duplicate-terminal hints.
    async fn apply_hint(
        &self,
        payment_id: Uuid,
        hint: Hint,
        status_reason: Option<String>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Explicit client-initiated cancellation. Allowed only while
    /// non-terminal; reuses the same lock-reload-transition shape as
    /// [`Store::apply_hint`] with a fixed target of `CANCELED`.
    async fn cancel_payment(&self, payment_id: Uuid) -> Result<TransitionOutcome, StoreError>;

    /// All non-terminal payments, for the startup sweeper.
    async fn active_payments(&self) -> Result<Vec<PaymentRequest>, StoreError>;

    // --- events ----------------------------------------------------------
    async fn events_since(
        &self,
        client_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<PaymentEvent>, StoreError>;
}
