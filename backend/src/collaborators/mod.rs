//! Interfaces to systems the pipeline consults but does not own.

pub mod billing;
pub mod credentials;
pub mod dry_run;
pub mod event_id;
pub mod trust;

pub use billing::{BillingGate, BillingReservation};
pub use credentials::CredentialDecryptor;
pub use event_id::{EventIdGenerator, EventIdInput, NormalizedLineItem, Sha256EventIdGenerator};
pub use trust::{
    ConsentState, ConsentStrategy, PlatformEligibility, Receipt, ReceiptKey, ReceiptMap,
    ShopContext, TrustEvaluation, TrustEvaluator, TrustLevel,
};
