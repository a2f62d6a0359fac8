use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{CreateInvoiceParams, ProviderAdapter, ProviderInvoiceState, ProviderInvoiceStatus};
use crate::domain::Invoice;
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// HTTP client for the external Lightning provider. The only things that
/// matter about the provider are its three endpoints: create invoice,
/// fetch invoice, and the webhook signature scheme it uses — everything
/// else about how it runs is out of scope.
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    store_id: String,
}

impl HttpProviderAdapter {
    pub fn new(base_url: String, api_key: String, store_id: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            store_id,
        })
    }
}

#[derive(Deserialize)]
struct CreateInvoiceResponseBody {
    id: String,
    checkout_link: String,
    #[serde(rename = "BOLT11")]
    bolt11: String,
    expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct InvoiceStatusResponseBody {
    id: String,
    status: String,
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<Invoice, AppError> {
        let url = format!("{}/api/v1/stores/{}/lightning/invoices", self.base_url, self.store_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "amount": params.amount,
                "currency": params.currency,
                "description": params.description,
                "externalReference": params.external_reference,
            }))
            .send()
            .await
            .map_err(|e| AppError::ProviderError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::ProviderError(format!(
                "invoice creation failed with status {}",
                resp.status()
            )));
        }

        let body: CreateInvoiceResponseBody = resp
            .json()
            .await
            .map_err(|e| AppError::ProviderError(e.to_string()))?;

        Ok(Invoice {
            provider: "lightning-provider".to_string(),
            provider_invoice_id: body.id,
            checkout_link: body.checkout_link,
            bolt11: body.bolt11,
            expires_at: body.expiry,
        })
    }

    async fn get_invoice(&self, provider_invoice_id: &str) -> Result<ProviderInvoiceState, AppError> {
        let url = format!(
            "{}/api/v1/stores/{}/lightning/invoices/{}",
            self.base_url, self.store_id, provider_invoice_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| AppError::ProviderError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::ProviderError(format!(
                "invoice fetch failed with status {}",
                resp.status()
            )));
        }

        let body: InvoiceStatusResponseBody = resp
            .json()
            .await
            .map_err(|e| AppError::ProviderError(e.to_string()))?;

        let status = match body.status.as_str() {
            "Settled" => ProviderInvoiceStatus::Settled,
            "Expired" => ProviderInvoiceStatus::Expired,
            "Invalid" => ProviderInvoiceStatus::Invalid,
            _ => ProviderInvoiceStatus::Pending,
        };

        Ok(ProviderInvoiceState {
            status,
            provider_invoice_id: body.id,
        })
    }
}

/// Signature verification helper shared with the webhook ingress: HMAC-SHA256
/// of the raw request body, compared in constant time. `header` is the full
/// `sha256=<hex>` value.
pub fn verify_webhook_signature(secret: &str, raw_body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(&expected_bytes[..]).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_correctly_signed_body() {
        let body = br#"{"type":"InvoiceSettled","invoiceId":"inv_1"}"#;
        let header = sign("whsec_test", body);
        assert!(verify_webhook_signature("whsec_test", body, &header));
    }

    #[test]
    fn rejects_a_tampered_body() {
        let body = br#"{"type":"InvoiceSettled","invoiceId":"inv_1"}"#;
        let header = sign("whsec_test", body);
        let tampered = br#"{"type":"InvoiceSettled","invoiceId":"inv_2"}"#;
        assert!(!verify_webhook_signature("whsec_test", tampered, &header));
    }

    #[test]
    fn rejects_a_signature_from_the_wrong_secret() {
        let body = br#"{"type":"InvoiceSettled","invoiceId":"inv_1"}"#;
        let header = sign("some-other-secret", body);
        assert!(!verify_webhook_signature("whsec_test", body, &header));
    }

    #[test]
    fn rejects_a_malformed_header() {
        let body = b"{}";
        assert!(!verify_webhook_signature("whsec_test", body, "not-a-signature"));
        assert!(!verify_webhook_signature("whsec_test", body, "sha256=not-hex"));
    }
}
