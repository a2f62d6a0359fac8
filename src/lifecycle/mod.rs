use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::callback::CallbackNotifier;
use crate::config::Settings;
use crate::domain::{
    CreatePaymentRequest, Hint, IdempotencyFingerprint, PaymentRequest, PaymentStatus,
};
use crate::error::AppError;
use crate::events::EventBus;
use crate::monitor::MonitorPool;
use crate::provider::{CreateInvoiceParams, ProviderAdapter};
use crate::store::{Store, TransitionOutcome};

/// The per-payment state machine. Holds the store, event bus, provider
/// adapter, monitor scheduler, and callback notifier — everything needed
/// to turn a create request into a monitored, observable payment and to
/// apply advisory hints from the webhook and the poller without ever
/// letting either bypass the transition rules.
pub struct LifecycleEngine {
    store: Arc<dyn Store>,
    bus: EventBus,
    provider: Arc<dyn ProviderAdapter>,
    settings: Arc<Settings>,
    monitor: Arc<MonitorPool>,
    callback: Arc<CallbackNotifier>,
}

impl LifecycleEngine {
    /// Constructs the engine and its monitor pool together: the pool holds
    /// a `Weak` back-reference to the engine so scheduled workers can feed
    /// hints back through `apply_hint` without a reference cycle keeping
    /// either alive past the other.
    pub fn build(
        store: Arc<dyn Store>,
        bus: EventBus,
        provider: Arc<dyn ProviderAdapter>,
        settings: Arc<Settings>,
        callback: Arc<CallbackNotifier>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_engine| {
            let monitor = MonitorPool::new(
                weak_engine.clone(),
                store.clone(),
                provider.clone(),
                settings.clone(),
            );
            LifecycleEngine {
                store,
                bus,
                provider,
                settings,
                monitor,
                callback,
            }
        })
    }

    pub fn monitor(&self) -> &Arc<MonitorPool> {
        &self.monitor
    }

    pub async fn create(
        &self,
        client_id: Uuid,
        req: CreatePaymentRequest,
    ) -> Result<PaymentRequest, AppError> {
        req.validate()?;

        if let Some(key) = &req.idempotency_key {
            if let Some((existing_id, stored_fp)) =
                self.store.find_idempotent_payment(client_id, key).await?
            {
                let fp = req.fingerprint();
                if fp != stored_fp {
                    return Err(AppError::Conflict(
                        "idempotency_key reused with a different request".into(),
                    ));
                }
                return self
                    .store
                    .get_payment_owned(client_id, existing_id)
                    .await?
                    .ok_or(AppError::NotFound);
            }
        }

        let now = Utc::now();
        let monitor_until = now + self.settings.monitoring_window();
        let fingerprint = req.idempotency_key.as_ref().map(|_| req.fingerprint());

        let payment = PaymentRequest {
            id: Uuid::new_v4(),
            client_id,
            status: PaymentStatus::Created,
            amount: req.amount,
            currency: req.currency.clone(),
            external_code: req.external_code.clone(),
            description: req.description.clone(),
            callback_url: req.callback_url.clone(),
            redirect_url: req.redirect_url.clone(),
            metadata: req.metadata.clone(),
            invoice: None,
            monitor_until,
            created_at: now,
            finalized_at: None,
            status_reason: None,
            idempotency_key: req.idempotency_key.clone(),
        };

        let (created, created_event) = self
            .store
            .insert_created_payment(payment, fingerprint)
            .await?;
        self.bus.publish((&created_event).into()).await;

        let invoice_result = self
            .provider
            .create_invoice(CreateInvoiceParams {
                amount: created.amount,
                currency: created.currency.clone(),
                description: created.description.clone(),
                external_reference: created.external_code.clone(),
            })
            .await;

        match invoice_result {
            Ok(invoice) => {
                let (pending, invoice_event) = self
                    .store
                    .attach_invoice(created.id, invoice, monitor_until)
                    .await?;
                self.bus.publish((&invoice_event).into()).await;
                self.monitor.schedule(pending.id, pending.monitor_until);
                Ok(pending)
            }
            Err(err) => {
                self.fail_creation(created.id, "PROVIDER_ERROR").await;
                Err(AppError::ProviderError(err.to_string()))
            }
        }
    }

    async fn fail_creation(&self, payment_id: Uuid, reason: &str) {
        match self
            .store
            .apply_hint(payment_id, Hint::Invalid, Some(reason.to_string()))
            .await
        {
            Ok(TransitionOutcome::Accepted(payment, event)) => {
                self.bus.publish((&event).into()).await;
                self.notify_if_terminal(&payment);
            }
            Ok(TransitionOutcome::Rejected(_)) => {
                tracing::warn!(%payment_id, "could not fail a payment that already left CREATED");
            }
            Err(err) => {
                tracing::error!(%payment_id, error = %err, "failed to record provider error");
            }
        }
    }

    pub async fn get(&self, client_id: Uuid, id: Uuid) -> Result<PaymentRequest, AppError> {
        self.store
            .get_payment_owned(client_id, id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Internal entry point used by the webhook ingress and the monitoring
    /// worker. Accepted transitions publish their event and fire the
    /// callback notifier on terminal states; rejected hints are a no-op,
    /// logged, never surfaced as an error to the caller.
    pub async fn apply_hint(
        &self,
        payment_id: Uuid,
        hint: Hint,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, AppError> {
        let outcome = self.store.apply_hint(payment_id, hint, reason).await?;
        match &outcome {
            TransitionOutcome::Accepted(payment, event) => {
                self.bus.publish(event.into()).await;
                self.notify_if_terminal(payment);
            }
            TransitionOutcome::Rejected(payment) => {
                tracing::info!(
                    payment_id = %payment_id,
                    current_status = %payment.status,
                    hint = ?hint,
                    "hint rejected: disallowed or duplicate transition"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, client_id: Uuid, id: Uuid) -> Result<PaymentRequest, AppError> {
        let payment = self
            .store
            .get_payment_owned(client_id, id)
            .await?
            .ok_or(AppError::NotFound)?;
        if payment.status.is_terminal() {
            return Err(AppError::Conflict("payment is already finalized".into()));
        }
        match self.store.cancel_payment(id).await? {
            TransitionOutcome::Accepted(payment, event) => {
                self.bus.publish((&event).into()).await;
                self.notify_if_terminal(&payment);
                Ok(payment)
            }
            TransitionOutcome::Rejected(payment) => Ok(payment),
        }
    }

    fn notify_if_terminal(&self, payment: &PaymentRequest) {
        if payment.status.is_terminal() {
            if let Some(url) = payment.callback_url.clone() {
                let notifier = self.callback.clone();
                let body = payment.to_observable_json();
                tokio::spawn(async move {
                    notifier.notify(&url, body).await;
                });
            }
        }
    }
}
