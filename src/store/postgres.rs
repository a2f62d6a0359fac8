use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Store, TransitionOutcome};
use crate::domain::{
    Client, EventType, Hint, IdempotencyFingerprint, Invoice, PaymentEvent, PaymentRequest,
    PaymentStatus,
};
use crate::error::StoreError;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    machine_id: String,
    password_hash: String,
    active: bool,
    allowed_source_ips: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(r: ClientRow) -> Self {
        Client {
            id: r.id,
            machine_id: r.machine_id,
            password_hash: r.password_hash,
            active: r.active,
            allowed_source_ips: r.allowed_source_ips,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    client_id: Uuid,
    status: String,
    amount: Decimal,
    currency: String,
    external_code: String,
    description: Option<String>,
    callback_url: Option<String>,
    redirect_url: Option<String>,
    metadata: Option<serde_json::Value>,
    invoice_provider: Option<String>,
    invoice_provider_id: Option<String>,
    invoice_checkout_link: Option<String>,
    invoice_bolt11: Option<String>,
    invoice_expires_at: Option<DateTime<Utc>>,
    monitor_until: DateTime<Utc>,
    created_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
    status_reason: Option<String>,
    idempotency_key: Option<String>,
}

impl TryFrom<PaymentRow> for PaymentRequest {
    type Error = StoreError;

    fn try_from(r: PaymentRow) -> Result<Self, StoreError> {
        let status = r
            .status
            .parse::<PaymentStatus>()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e.to_string())))?;
        let invoice = match (
            r.invoice_provider,
            r.invoice_provider_id,
            r.invoice_checkout_link,
            r.invoice_bolt11,
            r.invoice_expires_at,
        ) {
            (Some(provider), Some(provider_invoice_id), Some(checkout_link), Some(bolt11), Some(expires_at)) => {
                Some(Invoice {
                    provider,
                    provider_invoice_id,
                    checkout_link,
                    bolt11,
                    expires_at,
                })
            }
            _ => None,
        };
        Ok(PaymentRequest {
            id: r.id,
            client_id: r.client_id,
            status,
            amount: r.amount,
            currency: r.currency,
            external_code: r.external_code,
            description: r.description,
            callback_url: r.callback_url,
            redirect_url: r.redirect_url,
            metadata: r.metadata,
            invoice,
            monitor_until: r.monitor_until,
            created_at: r.created_at,
            finalized_at: r.finalized_at,
            status_reason: r.status_reason,
            idempotency_key: r.idempotency_key,
        })
    }
}

/// Locks the client's sequence counter row and hands back the next value,
/// leaving the row locked for the rest of the caller's transaction so no
/// other writer can observe or claim the same `seq`.
async fn next_seq(tx: &mut Transaction<'_, Postgres>, client_id: Uuid) -> Result<i64, StoreError> {
    let row: (i64,) = sqlx::query_as(
        "UPDATE client_event_seq SET next_seq = next_seq + 1 \
         WHERE client_id = $1 RETURNING next_seq - 1",
    )
    .bind(client_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::Backend(e.into()))?;
    Ok(row.0)
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
    payment_id: Uuid,
    event_type: EventType,
    payload: serde_json::Value,
) -> Result<PaymentEvent, StoreError> {
    let seq = next_seq(tx, client_id).await?;
    let emitted_at: (DateTime<Utc>,) = sqlx::query_as(
        "INSERT INTO payment_events (client_id, seq, event_type, payment_id, payload) \
         VALUES ($1, $2, $3, $4, $5) RETURNING emitted_at",
    )
    .bind(client_id)
    .bind(seq)
    .bind(event_type.as_wire_str())
    .bind(payment_id)
    .bind(&payload)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::Backend(e.into()))?;

    Ok(PaymentEvent {
        client_id,
        seq,
        event_type,
        payment_id,
        emitted_at: emitted_at.0,
        payload,
    })
}

async fn load_payment_for_update(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
) -> Result<PaymentRequest, StoreError> {
    let row: PaymentRow = sqlx::query_as("SELECT * FROM payment_requests WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?
        .ok_or(StoreError::NotFound)?;
    row.try_into()
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn create_client(&self, client: Client) -> Result<Client, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "INSERT INTO clients (id, machine_id, password_hash, active, allowed_source_ips) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(client.id)
        .bind(&client.machine_id)
        .bind(&client.password_hash)
        .bind(client.active)
        .bind(&client.allowed_source_ips)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("machine_id already registered".into())
            }
            other => StoreError::Backend(other.into()),
        })?;
        sqlx::query("INSERT INTO client_event_seq (client_id, next_seq) VALUES ($1, 1)")
            .bind(client.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(client)
    }

    async fn get_client_by_machine_id(&self, machine_id: &str) -> Result<Option<Client>, StoreError> {
        let row: Option<ClientRow> = sqlx::query_as("SELECT * FROM clients WHERE machine_id = $1")
            .bind(machine_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(Into::into))
    }

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        let row: Option<ClientRow> = sqlx::query_as("SELECT * FROM clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(Into::into))
    }

    async fn update_client(&self, client: Client) -> Result<Client, StoreError> {
        let result = sqlx::query(
            "UPDATE clients SET active = $2, allowed_source_ips = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(client.id)
        .bind(client.active)
        .bind(&client.allowed_source_ips)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(client)
    }

    async fn find_idempotent_payment(
        &self,
        client_id: Uuid,
        key: &str,
    ) -> Result<Option<(Uuid, IdempotencyFingerprint)>, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payment_requests WHERE client_id = $1 AND idempotency_key = $2",
        )
        .bind(client_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            None => Ok(None),
            Some(r) => {
                let fp = IdempotencyFingerprint {
                    amount: r.amount.normalize().to_string(),
                    currency: r.currency.clone(),
                    external_code: r.external_code.clone(),
                    payment_method: "BTC_LN".to_string(),
                    metadata: r.metadata.clone(),
                };
                Ok(Some((r.id, fp)))
            }
        }
    }

    async fn insert_created_payment(
        &self,
        payment: PaymentRequest,
        _fingerprint: Option<IdempotencyFingerprint>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "INSERT INTO payment_requests \
             (id, client_id, status, amount, currency, external_code, description, \
              callback_url, redirect_url, metadata, monitor_until, idempotency_key) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(payment.id)
        .bind(payment.client_id)
        .bind(payment.status.to_string())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.external_code)
        .bind(&payment.description)
        .bind(&payment.callback_url)
        .bind(&payment.redirect_url)
        .bind(&payment.metadata)
        .bind(payment.monitor_until)
        .bind(&payment.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("idempotency key already in use".into())
            }
            other => StoreError::Backend(other.into()),
        })?;

        let payload = payment.to_observable_json();
        let event = insert_event(&mut tx, payment.client_id, payment.id, EventType::PaymentCreated, payload).await?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok((payment, event))
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<PaymentRequest>, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as("SELECT * FROM payment_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_payment_owned(
        &self,
        client_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payment_requests WHERE id = $1 AND client_id = $2",
        )
        .bind(id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_payment_by_provider_invoice_id(
        &self,
        provider_invoice_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payment_requests WHERE invoice_provider_id = $1",
        )
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn attach_invoice(
        &self,
        payment_id: Uuid,
        invoice: Invoice,
        monitor_until: DateTime<Utc>,
    ) -> Result<(PaymentRequest, PaymentEvent), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        let current = load_payment_for_update(&mut tx, payment_id).await?;
        if current.status != PaymentStatus::Created {
            return Err(StoreError::Conflict("invoice can only attach to a CREATED payment".into()));
        }
        if current.invoice.is_some() {
            return Err(StoreError::Conflict("invoice already attached".into()));
        }

        sqlx::query(
            "UPDATE payment_requests SET status = $2, invoice_provider = $3, \
             invoice_provider_id = $4, invoice_checkout_link = $5, invoice_bolt11 = $6, \
             invoice_expires_at = $7, monitor_until = $8 WHERE id = $1",
        )
        .bind(payment_id)
        .bind(PaymentStatus::Pending.to_string())
        .bind(&invoice.provider)
        .bind(&invoice.provider_invoice_id)
        .bind(&invoice.checkout_link)
        .bind(&invoice.bolt11)
        .bind(invoice.expires_at)
        .bind(monitor_until)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let mut snapshot = current;
        snapshot.status = PaymentStatus::Pending;
        snapshot.invoice = Some(invoice);
        snapshot.monitor_until = monitor_until;

        let payload = snapshot.to_observable_json();
        let event = insert_event(
            &mut tx,
            snapshot.client_id,
            snapshot.id,
            EventType::PaymentInvoiceCreated,
            payload,
        )
        .await?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok((snapshot, event))
    }

    async fn apply_hint(
        &self,
        payment_id: Uuid,
        hint: Hint,
        status_reason: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        let current = load_payment_for_update(&mut tx, payment_id).await?;

        let Some(target) = hint.target_status() else {
            return Ok(TransitionOutcome::Rejected(current));
        };
        if !current.status.can_transition_to(target) {
            return Ok(TransitionOutcome::Rejected(current));
        }

        let finalized_at = if target.is_terminal() { Some(Utc::now()) } else { None };
        sqlx::query(
            "UPDATE payment_requests SET status = $2, status_reason = $3, finalized_at = $4 \
             WHERE id = $1",
        )
        .bind(payment_id)
        .bind(target.to_string())
        .bind(&status_reason)
        .bind(finalized_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let mut snapshot = current;
        snapshot.status = target;
        snapshot.status_reason = status_reason;
        snapshot.finalized_at = finalized_at;

        let payload = snapshot.to_observable_json();
        let event_type = hint.event_type().unwrap_or(EventType::PaymentStatusChanged);
        let event = insert_event(&mut tx, snapshot.client_id, snapshot.id, event_type, payload).await?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(TransitionOutcome::Accepted(snapshot, event))
    }

    async fn cancel_payment(&self, payment_id: Uuid) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        let current = load_payment_for_update(&mut tx, payment_id).await?;
        if current.status.is_terminal() {
            return Ok(TransitionOutcome::Rejected(current));
        }

        let finalized_at = Utc::now();
        sqlx::query(
            "UPDATE payment_requests SET status = $2, status_reason = $3, finalized_at = $4 \
             WHERE id = $1",
        )
        .bind(payment_id)
        .bind(PaymentStatus::Canceled.to_string())
        .bind("CLIENT_CANCELED")
        .bind(finalized_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let mut snapshot = current;
        snapshot.status = PaymentStatus::Canceled;
        snapshot.status_reason = Some("CLIENT_CANCELED".to_string());
        snapshot.finalized_at = Some(finalized_at);

        let payload = snapshot.to_observable_json();
        let event = insert_event(
            &mut tx,
            snapshot.client_id,
            snapshot.id,
            EventType::PaymentStatusChanged,
            payload,
        )
        .await?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(TransitionOutcome::Accepted(snapshot, event))
    }

    async fn active_payments(&self) -> Result<Vec<PaymentRequest>, StoreError> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payment_requests WHERE status IN ('CREATED', 'PENDING')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn events_since(
        &self,
        client_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<PaymentEvent>, StoreError> {
        let rows: Vec<(i64, String, Uuid, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT seq, event_type, payment_id, emitted_at, payload FROM payment_events \
             WHERE client_id = $1 AND seq > $2 ORDER BY seq ASC",
        )
        .bind(client_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.into_iter()
            .map(|(seq, event_type, payment_id, emitted_at, payload)| {
                Ok(PaymentEvent {
                    client_id,
                    seq,
                    event_type: parse_event_type(&event_type)?,
                    payment_id,
                    emitted_at,
                    payload,
                })
            })
            .collect()
    }
}

fn parse_event_type(s: &str) -> Result<EventType, StoreError> {
    Ok(match s {
        "payment.created" => EventType::PaymentCreated,
        "payment.invoice_created" => EventType::PaymentInvoiceCreated,
        "payment.status_changed" => EventType::PaymentStatusChanged,
        "payment.paid" => EventType::PaymentPaid,
        "payment.expired" => EventType::PaymentExpired,
        "payment.timed_out" => EventType::PaymentTimedOut,
        "payment.failed" => EventType::PaymentFailed,
        other => return Err(StoreError::Backend(anyhow::anyhow!("unknown event type: {other}"))),
    })
}
