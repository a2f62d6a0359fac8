pub mod client;
pub mod event;
pub mod payment;

pub use client::Client;
pub use event::{EventType, PaymentEvent, PublishedEvent};
pub use payment::{
    CreatePaymentRequest, Hint, IdempotencyFingerprint, Invoice, PaymentRequest, PaymentStatus,
};
