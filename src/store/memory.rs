use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Store, TransitionOutcome};
use crate::domain::{
    Client, EventType, Hint, IdempotencyFingerprint, Invoice, PaymentEvent, PaymentRequest,
    PaymentStatus,
};
use crate::error::StoreError;

/// A single-process, single-lock store used by tests and local
/// development without Postgres. Mirrors the donation backend's original
/// `Arc<Mutex<HashMap<...>>>` state, generalized to the full data model.
/// Correctness (contiguous `seq`, one event per transition, row-lock
/// semantics) is preserved by serializing all mutation through one lock;
/// it trades the real store's per-payment concurrency for simplicity.
#[derive(Default)]
struct Inner {
    clients: HashMap<Uuid, Client>,
    machine_id_index: HashMap<String, Uuid>,
    payments: HashMap<Uuid, PaymentRequest>,
    events: HashMap<Uuid, Vec<PaymentEvent>>,
    next_seq: HashMap<Uuid, i64>,
    idempotency: HashMap<(Uuid, String), (Uuid, IdempotencyFingerprint)>,
}

pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Inner {
    fn append_event(
        &mut self,
        client_id: Uuid,
        payment_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> PaymentEvent {
        let seq = self.next_seq.entry(client_id).or_insert(0);
        *seq += 1;
        let event = PaymentEvent {
            client_id,
            seq: *seq,
            event_type,
            payment_id,
            emitted_at: Utc::now(),
            payload,
        };
        self.events.entry(client_id).or_default().push(event.clone());
        event
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_client(&self, client: Client) -> Result<Client, StoreError> {
        let mut g = self.inner.lock().await;
        if g.machine_id_index.contains_key(&client.machine_id) {
            return Err(StoreError::Conflict("machine_id already registered".into()));
        }
        g.machine_id_index.insert(client.machine_id.clone(), client.id);
        g.clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn get_client_by_machine_id(&self, machine_id: &str) -> Result<Option<Client>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.machine_id_index
            .get(machine_id)
            .and_then(|id| g.clients.get(id))
            .cloned())
    }

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.clients.get(&id).cloned())
    }

    async fn update_client(&self, client: Client) -> Result<Client, StoreError> {
        let mut g = self.inner.lock().await;
        if !g.clients.contains_key(&client.id) {
            return Err(StoreError::NotFound);
        }
        g.clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn find_idempotent_payment(
        &self,
        client_id: Uuid,
        key: &str,
    ) -> Result<Option<(Uuid, IdempotencyFingerprint)>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.idempotency.get(&(client_id, key.to_string())).cloned())
    }

    async fn insert_created_payment(
        &self,
        payment: PaymentRequest,
        fingerprint: Option<IdempotencyFingerprint>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError> {
        let mut g = self.inner.lock().await;
        if let Some(key) = &payment.idempotency_key {
            if g.idempotency.contains_key(&(payment.client_id, key.clone())) {
                return Err(StoreError::Conflict("idempotency key already in use".into()));
            }
        }
        let payload = payment.to_observable_json();
        let event = g.append_event(payment.client_id, payment.id, EventType::PaymentCreated, payload);
        if let (Some(key), Some(fp)) = (payment.idempotency_key.clone(), fingerprint) {
            g.idempotency.insert((payment.client_id, key), (payment.id, fp));
        }
        g.payments.insert(payment.id, payment.clone());
        Ok((payment, event))
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<PaymentRequest>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.payments.get(&id).cloned())
    }

    async fn get_payment_owned(
        &self,
        client_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.payments
            .get(&id)
            .filter(|p| p.client_id == client_id)
            .cloned())
    }

    async fn find_payment_by_provider_invoice_id(
        &self,
        provider_invoice_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.payments
            .values()
            .find(|p| {
                p.invoice
                    .as_ref()
                    .is_some_and(|inv| inv.provider_invoice_id == provider_invoice_id)
            })
            .cloned())
    }

    async fn attach_invoice(
        &self,
        payment_id: Uuid,
        invoice: Invoice,
        monitor_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError> {
        let mut g = self.inner.lock().await;
        let payment = g.payments.get_mut(&payment_id).ok_or(StoreError::NotFound)?;
        if payment.status != PaymentStatus::Created {
            return Err(StoreError::Conflict("invoice can only attach to a CREATED payment".into()));
        }
        if payment.invoice.is_some() {
            return Err(StoreError::Conflict("invoice already attached".into()));
        }
        payment.invoice = Some(invoice);
        payment.status = PaymentStatus::Pending;
        payment.monitor_until = monitor_until;
        let snapshot = payment.clone();
        let payload = snapshot.to_observable_json();
        let event = g.append_event(
            snapshot.client_id,
            snapshot.id,
            EventType::PaymentInvoiceCreated,
            payload,
        );
        Ok((snapshot, event))
    }

    async fn apply_hint(
        &self,
        payment_id: Uuid,
        hint: Hint,
        status_reason: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut g = self.inner.lock().await;
        let current = g.payments.get(&payment_id).ok_or(StoreError::NotFound)?.clone();

        let Some(target) = hint.target_status() else {
            return Ok(TransitionOutcome::Rejected(current));
        };
        if !current.status.can_transition_to(target) {
            return Ok(TransitionOutcome::Rejected(current));
        }

        let payment = g.payments.get_mut(&payment_id).unwrap();
        payment.status = target;
        payment.status_reason = status_reason;
        if target.is_terminal() {
            payment.finalized_at = Some(Utc::now());
        }
        let snapshot = payment.clone();
        let payload = snapshot.to_observable_json();
        let event_type = hint.event_type().unwrap_or(EventType::PaymentStatusChanged);
        let event = g.append_event(snapshot.client_id, snapshot.id, event_type, payload);
        Ok(TransitionOutcome::Accepted(snapshot, event))
    }

    async fn cancel_payment(&self, payment_id: Uuid) -> Result<TransitionOutcome, StoreError> {
        let mut g = self.inner.lock().await;
        let current = g.payments.get(&payment_id).ok_or(StoreError::NotFound)?.clone();
        if current.status.is_terminal() {
            return Ok(TransitionOutcome::Rejected(current));
        }
        let payment = g.payments.get_mut(&payment_id).unwrap();
        payment.status = PaymentStatus::Canceled;
        payment.status_reason = Some("CLIENT_CANCELED".to_string());
        payment.finalized_at = Some(Utc::now());
        let snapshot = payment.clone();
        let payload = snapshot.to_observable_json();
        let event = g.append_event(
            snapshot.client_id,
            snapshot.id,
            EventType::PaymentStatusChanged,
            payload,
        );
        Ok(TransitionOutcome::Accepted(snapshot, event))
    }

    async fn active_payments(&self) -> Result<Vec<PaymentRequest>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.payments
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn events_since(
        &self,
        client_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<PaymentEvent>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.events
            .get(&client_id)
            .map(|evs| evs.iter().filter(|e| e.seq > after_seq).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CreatePaymentRequest;

    fn new_client() -> Client {
        let now = Utc::now();
        Client {
            id: Uuid::new_v4(),
            machine_id: format!("kiosk-{}", Uuid::new_v4()),
            password_hash: "unused".to_string(),
            active: true,
            allowed_source_ips: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn new_payment(client_id: Uuid, idempotency_key: Option<&str>) -> PaymentRequest {
        let req = CreatePaymentRequest {
            payment_method: "BTC_LN".to_string(),
            amount: rust_decimal::Decimal::new(500, 2),
            currency: "USD".to_string(),
            external_code: "ext-1".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: None,
            idempotency_key: idempotency_key.map(str::to_string),
        };
        let now = Utc::now();
        PaymentRequest {
            id: Uuid::new_v4(),
            client_id,
            status: PaymentStatus::Created,
            amount: req.amount,
            currency: req.currency.clone(),
            external_code: req.external_code.clone(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: None,
            invoice: None,
            monitor_until: now + chrono::Duration::seconds(120),
            created_at: now,
            finalized_at: None,
            status_reason: None,
            idempotency_key: req.idempotency_key,
        }
    }

    #[tokio::test]
    async fn insert_created_payment_emits_seq_one_for_a_fresh_client() {
        let store = InMemoryStore::new();
        let client = new_client();
        store.create_client(client.clone()).await.unwrap();
        let payment = new_payment(client.id, None);
        let (_, event) = store.insert_created_payment(payment, None).await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.event_type, EventType::PaymentCreated);
    }

    #[tokio::test]
    async fn repeated_idempotency_key_is_rejected() {
        let store = InMemoryStore::new();
        let client = new_client();
        store.create_client(client.clone()).await.unwrap();
        let first = new_payment(client.id, Some("dup"));
        let fp = IdempotencyFingerprint {
            amount: first.amount.to_string(),
            currency: first.currency.clone(),
            external_code: first.external_code.clone(),
            payment_method: "BTC_LN".to_string(),
            metadata: None,
        };
        store
            .insert_created_payment(first, Some(fp))
            .await
            .unwrap();

        let second = new_payment(client.id, Some("dup"));
        let result = store.insert_created_payment(second, None).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn apply_hint_rejects_a_transition_the_state_machine_disallows() {
        let store = InMemoryStore::new();
        let client = new_client();
        store.create_client(client.clone()).await.unwrap();
        let payment = new_payment(client.id, None);
        let (created, _) = store.insert_created_payment(payment, None).await.unwrap();

        // CREATED can't jump straight to PAID.
        let outcome = store
            .apply_hint(created.id, Hint::Paid, Some("PROVIDER_SETTLED".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn apply_hint_accepts_pending_to_paid_and_advances_seq() {
        let store = InMemoryStore::new();
        let client = new_client();
        store.create_client(client.clone()).await.unwrap();
        let payment = new_payment(client.id, None);
        let (created, _) = store.insert_created_payment(payment, None).await.unwrap();

        let invoice = Invoice {
            provider: "lightning-provider".to_string(),
            provider_invoice_id: "inv_1".to_string(),
            checkout_link: "https://pay.example.com/inv_1".to_string(),
            bolt11: "lnbc1...".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        let (pending, invoice_event) = store
            .attach_invoice(created.id, invoice, created.monitor_until)
            .await
            .unwrap();
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(invoice_event.seq, 2);

        let outcome = store
            .apply_hint(pending.id, Hint::Paid, Some("PROVIDER_SETTLED".to_string()))
            .await
            .unwrap();
        match outcome {
            TransitionOutcome::Accepted(paid, event) => {
                assert_eq!(paid.status, PaymentStatus::Paid);
                assert!(paid.finalized_at.is_some());
                assert_eq!(event.seq, 3);
                assert_eq!(event.event_type, EventType::PaymentPaid);
            }
            TransitionOutcome::Rejected(_) => panic!("expected PENDING -> PAID to be accepted"),
        }
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_once_terminal() {
        let store = InMemoryStore::new();
        let client = new_client();
        store.create_client(client.clone()).await.unwrap();
        let payment = new_payment(client.id, None);
        let (created, _) = store.insert_created_payment(payment, None).await.unwrap();
        store
            .apply_hint(created.id, Hint::Invalid, Some("PROVIDER_ERROR".to_string()))
            .await
            .unwrap();

        let outcome = store.cancel_payment(created.id).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected(_)));
    }
}
