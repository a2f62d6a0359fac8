pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::Invoice;
use crate::error::AppError;

pub use http::HttpProviderAdapter;

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub external_reference: String,
}

/// Status as reported directly by the provider, prior to mapping into our
/// own [`crate::domain::Hint`] vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderInvoiceStatus {
    Pending,
    Settled,
    Expired,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct ProviderInvoiceState {
    pub status: ProviderInvoiceStatus,
    pub provider_invoice_id: String,
}

/// The external collaborator boundary: everything this service knows
/// about the Lightning provider is expressed through this trait, so the
/// lifecycle engine and monitoring worker can be exercised in tests
/// against a fake without a real provider account.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<Invoice, AppError>;
    async fn get_invoice(&self, provider_invoice_id: &str) -> Result<ProviderInvoiceState, AppError>;
}
