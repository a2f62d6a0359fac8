use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::domain::{Hint, PaymentStatus};
use crate::lifecycle::LifecycleEngine;
use crate::provider::{ProviderAdapter, ProviderInvoiceStatus};
use crate::store::Store;

const MAX_CONSECUTIVE_PROVIDER_ERRORS: u32 = 3;

/// Per-payment bounded polling. Advisory only: every observed terminal
/// state is submitted to the engine as a hint and the engine's own
/// transition rules decide whether it sticks. Idempotent and cancel-safe —
/// a worker that dies mid-poll leaves nothing for the next one to undo,
/// and the startup sweep re-discovers any payment still non-terminal.
pub struct MonitorPool {
    engine: Weak<LifecycleEngine>,
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderAdapter>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl MonitorPool {
    pub fn new(
        engine: Weak<LifecycleEngine>,
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderAdapter>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            provider,
            poll_interval: settings.poll_interval(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns a bounded polling task for a single payment. Safe to call
    /// more than once for the same payment: each worker reloads the
    /// payment before acting and any transition it submits is itself
    /// idempotent at the engine.
    pub fn schedule(self: &Arc<Self>, payment_id: Uuid, monitor_until: DateTime<Utc>) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.run(payment_id, monitor_until).await;
        });
    }

    async fn run(&self, payment_id: Uuid, monitor_until: DateTime<Utc>) {
        let mut consecutive_errors: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let Ok(Some(payment)) = self.store.get_payment(payment_id).await else {
                return;
            };
            if payment.status.is_terminal() {
                return;
            }

            if Utc::now() >= monitor_until {
                self.submit_hint(payment_id, Hint::TimedOut, "MONITOR_WINDOW_EXCEEDED")
                    .await;
                return;
            }

            let Some(invoice) = payment.invoice.as_ref() else {
                // Not yet PENDING; nothing to poll the provider about yet.
                self.sleep_or_cancel().await;
                continue;
            };

            match self.provider.get_invoice(&invoice.provider_invoice_id).await {
                Ok(state) => {
                    consecutive_errors = 0;
                    match state.status {
                        ProviderInvoiceStatus::Settled => {
                            self.submit_hint(payment_id, Hint::Paid, "PROVIDER_SETTLED").await;
                            return;
                        }
                        ProviderInvoiceStatus::Expired => {
                            self.submit_hint(payment_id, Hint::Expired, "PROVIDER_EXPIRED")
                                .await;
                            return;
                        }
                        ProviderInvoiceStatus::Invalid => {
                            self.submit_hint(payment_id, Hint::Invalid, "PROVIDER_INVALID")
                                .await;
                            return;
                        }
                        ProviderInvoiceStatus::Pending => {}
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::warn!(%payment_id, attempt = consecutive_errors, error = %err, "provider poll failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_PROVIDER_ERRORS {
                        self.submit_hint(payment_id, Hint::Invalid, "PROVIDER_UNREACHABLE")
                            .await;
                        return;
                    }
                }
            }

            self.sleep_or_cancel().await;
        }
    }

    async fn sleep_or_cancel(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn submit_hint(&self, payment_id: Uuid, hint: Hint, reason: &str) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(err) = engine.apply_hint(payment_id, hint, Some(reason.to_string())).await {
            tracing::error!(%payment_id, error = %err, "monitor worker failed to apply hint");
        }
    }

    /// Run once at startup: any payment left `CREATED`/`PENDING` by a crash
    /// either gets a fresh worker (if its window hasn't elapsed) or is
    /// moved straight to `TIMED_OUT`. A `CREATED` row is treated exactly
    /// like a `PENDING` one here — `run()` already tolerates a payment with
    /// no invoice yet by sleeping and retrying rather than polling the
    /// provider, so the same worker covers both statuses.
    pub async fn sweep(self: &Arc<Self>) -> anyhow::Result<()> {
        let active = self.store.active_payments().await?;
        debug_assert!(active
            .iter()
            .all(|p| matches!(p.status, PaymentStatus::Created | PaymentStatus::Pending)));
        let now = Utc::now();
        for payment in active {
            if payment.monitor_until > now {
                self.schedule(payment.id, payment.monitor_until);
            } else {
                self.submit_hint(payment.id, Hint::TimedOut, "MONITOR_WINDOW_EXCEEDED")
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::callback::CallbackNotifier;
    use crate::domain::{Client, CreatePaymentRequest, PaymentStatus};
    use crate::error::AppError;
    use crate::events::EventBus;
    use crate::lifecycle::LifecycleEngine;
    use crate::provider::{CreateInvoiceParams, ProviderAdapter, ProviderInvoiceState, ProviderInvoiceStatus};
    use crate::store::InMemoryStore;

    fn test_settings() -> Settings {
        Settings {
            database_url: "unused".to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "error".to_string(),
            jwt_signing_key_path: String::new(),
            jwt_verifying_key_paths: vec![],
            jwt_issuer: "test".to_string(),
            token_ttl_secs: 600,
            admin_token: "test-admin-token".to_string(),
            provider_base_url: "https://provider.invalid".to_string(),
            provider_api_key: "unused".to_string(),
            provider_store_id: "unused".to_string(),
            webhook_secret: "test-webhook-secret".to_string(),
            provider_event_map: HashMap::new(),
            monitoring_window_secs: 60,
            poll_interval_secs: 0,
            provider_timeout_secs: 10,
            auth_rate_limit_per_min: 1000,
            payment_rate_limit_per_min: 1000,
            stream_queue_len: 64,
            keepalive_secs: 15,
        }
    }

    /// A provider whose `get_invoice` behavior is controlled per-call by the
    /// test: always erroring (to drive the 3-consecutive-failures path) or
    /// always pending (to let the monitoring window itself expire).
    struct ScriptedProvider {
        always_error: bool,
        invoices: StdMutex<HashMap<String, ()>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        async fn create_invoice(&self, _params: CreateInvoiceParams) -> Result<crate::domain::Invoice, AppError> {
            let id = format!("inv_{}", Uuid::new_v4());
            self.invoices.lock().unwrap().insert(id.clone(), ());
            Ok(crate::domain::Invoice {
                provider: "scripted".to_string(),
                provider_invoice_id: id.clone(),
                checkout_link: format!("https://pay.example.com/{id}"),
                bolt11: "lnbc1fake".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn get_invoice(&self, provider_invoice_id: &str) -> Result<ProviderInvoiceState, AppError> {
            if self.always_error {
                return Err(AppError::ProviderError("provider unreachable".to_string()));
            }
            Ok(ProviderInvoiceState {
                status: ProviderInvoiceStatus::Pending,
                provider_invoice_id: provider_invoice_id.to_string(),
            })
        }
    }

    async fn build_engine(settings: Settings, provider: Arc<ScriptedProvider>) -> (Arc<LifecycleEngine>, Arc<dyn Store>, Uuid) {
        let settings = Arc::new(settings);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(settings.stream_queue_len);
        let callback = Arc::new(CallbackNotifier::new(settings.provider_timeout()).unwrap());
        let engine = LifecycleEngine::build(store.clone(), bus, provider, settings, callback);

        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4(),
            machine_id: "kiosk-monitor-test".to_string(),
            password_hash: crate::auth::hash_password("hunter2").unwrap(),
            active: true,
            allowed_source_ips: vec![],
            created_at: now,
            updated_at: now,
        };
        let client = store.create_client(client).await.unwrap();
        (engine, store, client.id)
    }

    fn create_request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            payment_method: "BTC_LN".to_string(),
            amount: Decimal::new(1250, 2),
            currency: "USD".to_string(),
            external_code: "order-monitor-test".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: None,
            idempotency_key: None,
        }
    }

    async fn poll_until<F: Fn(PaymentStatus) -> bool>(
        store: &Arc<dyn Store>,
        client_id: Uuid,
        payment_id: Uuid,
        budget: Duration,
        pred: F,
    ) -> crate::domain::PaymentRequest {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let payment = store
                .get_payment_owned(client_id, payment_id)
                .await
                .unwrap()
                .unwrap();
            if pred(payment.status) {
                return payment;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition never met, last status: {:?}", payment.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn three_consecutive_provider_errors_fail_the_payment() {
        let provider = Arc::new(ScriptedProvider {
            always_error: true,
            invoices: StdMutex::new(HashMap::new()),
        });
        let (engine, store, client_id) = build_engine(test_settings(), provider).await;

        let payment = engine.create(client_id, create_request()).await.unwrap();
        let settled = poll_until(
            &store,
            client_id,
            payment.id,
            Duration::from_secs(2),
            |s| s == PaymentStatus::Failed,
        )
        .await;
        assert_eq!(settled.status_reason.as_deref(), Some("PROVIDER_UNREACHABLE"));
    }

    #[tokio::test]
    async fn monitoring_window_elapsing_times_out_a_still_pending_payment() {
        let mut settings = test_settings();
        settings.monitoring_window_secs = 0;
        let provider = Arc::new(ScriptedProvider {
            always_error: false,
            invoices: StdMutex::new(HashMap::new()),
        });
        let (engine, store, client_id) = build_engine(settings, provider).await;

        let payment = engine.create(client_id, create_request()).await.unwrap();
        let settled = poll_until(
            &store,
            client_id,
            payment.id,
            Duration::from_secs(2),
            |s| s == PaymentStatus::TimedOut,
        )
        .await;
        assert_eq!(settled.status_reason.as_deref(), Some("MONITOR_WINDOW_EXCEEDED"));
    }

    #[tokio::test]
    async fn sweep_reschedules_a_created_row_whose_window_has_not_elapsed() {
        let provider = Arc::new(ScriptedProvider {
            always_error: false,
            invoices: StdMutex::new(HashMap::new()),
        });
        let (engine, store, client_id) = build_engine(test_settings(), provider).await;

        // Simulate a crash right after CREATE: a row stuck in CREATED with
        // its monitor window still well in the future.
        let now = Utc::now();
        let payment = crate::domain::PaymentRequest {
            id: Uuid::new_v4(),
            client_id,
            status: PaymentStatus::Created,
            amount: Decimal::new(500, 2),
            currency: "USD".to_string(),
            external_code: "order-sweep-test".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: None,
            invoice: None,
            monitor_until: now + chrono::Duration::seconds(60),
            created_at: now,
            finalized_at: None,
            status_reason: None,
            idempotency_key: None,
        };
        store.insert_created_payment(payment.clone(), None).await.unwrap();

        engine.monitor().sweep().await.unwrap();

        // A worker was scheduled rather than the row being killed outright:
        // since it has no invoice yet, `run()` just sleeps and waits, so the
        // row is still non-terminal shortly after the sweep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reloaded = store
            .get_payment_owned(client_id, payment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, PaymentStatus::Created);
    }

    #[tokio::test]
    async fn sweep_times_out_a_row_whose_window_already_elapsed() {
        let provider = Arc::new(ScriptedProvider {
            always_error: false,
            invoices: StdMutex::new(HashMap::new()),
        });
        let (engine, store, client_id) = build_engine(test_settings(), provider).await;

        let now = Utc::now();
        let payment = crate::domain::PaymentRequest {
            id: Uuid::new_v4(),
            client_id,
            status: PaymentStatus::Created,
            amount: Decimal::new(500, 2),
            currency: "USD".to_string(),
            external_code: "order-sweep-timeout".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: None,
            invoice: None,
            monitor_until: now - chrono::Duration::seconds(1),
            created_at: now,
            finalized_at: None,
            status_reason: None,
            idempotency_key: None,
        };
        store.insert_created_payment(payment.clone(), None).await.unwrap();

        engine.monitor().sweep().await.unwrap();

        let settled = poll_until(
            &store,
            client_id,
            payment.id,
            Duration::from_secs(1),
            |s| s == PaymentStatus::TimedOut,
        )
        .await;
        assert_eq!(settled.status_reason.as_deref(), Some("MONITOR_WINDOW_EXCEEDED"));
    }
}
