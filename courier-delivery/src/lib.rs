//! Delivery orchestration for courier
//!
//! [`DeliveryProcessor`] consumes [`DeliveryEvent`](courier_common::DeliveryEvent)s
//! from the main lane and walks each one through validation, provider
//! selection, the daily quota and the provider send. Every failure ends in one
//! of four ways, decided by [`DeliveryError`]:
//!
//! - rejected: dropped, never retried
//! - throttled: requeued after the throttle delay, not counted as an attempt
//! - transient infrastructure failure: requeued after the transient delay, not counted
//! - send failure: requeued with exponential backoff, dead-lettered once exhausted

pub mod credentials;
mod error;
pub mod policy;
pub mod processor;
pub mod provider;
mod validator;

pub use credentials::{CredentialSeed, CredentialStore, Credentials, MemoryCredentialStore};
pub use error::{CredentialError, DeliveryError, RejectReason};
pub use policy::RetryPolicy;
pub use processor::{
    Components, DeliveryConfig, DeliveryOutcome, DeliveryProcessor, DeliveryStage,
};
pub use provider::{EmailProvider, ProviderConfig, ProviderRegistry, SendOutcome};
pub use validator::{AddressValidator, ValidatorConfig, validate_subject};
