//! Typed errors for delivery.
//!
//! [`DeliveryError`] is the whole retry taxonomy:
//! - `Rejected`: permanent, the event is dropped
//! - `Throttled`: quota exhausted, retried on a fixed schedule
//! - `TransientInfra`: a store, broker or registry failure, retried on a short fixed schedule
//! - `SendFailure`: the provider refused or failed, retried with backoff

use std::fmt;

use courier_broker::BrokerError;
use courier_common::ProviderKind;
use courier_gates::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that must not be retried.
    #[error("Rejected: {0}")]
    Rejected(RejectReason),

    /// The daily quota for the selected provider is used up.
    #[error("Daily quota exhausted for {provider}")]
    Throttled { provider: ProviderKind },

    /// Infrastructure the pipeline depends on failed.
    #[error("Transient failure: {0}")]
    TransientInfra(String),

    /// The provider did not accept the message.
    #[error("Send failed: {0}")]
    SendFailure(String),
}

/// Why an event was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidAddress(String),
    DisposableDomain(String),
    /// The subject would break out of its header line.
    UnsafeSubject,
    NoCredentials,
    /// Submitted with no attempts left.
    RetriesExhausted(u32),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress(address) => write!(f, "invalid address {address}"),
            Self::DisposableDomain(domain) => write!(f, "disposable domain {domain}"),
            Self::UnsafeSubject => f.write_str("subject contains a line break"),
            Self::NoCredentials => f.write_str("no provider credentials"),
            Self::RetriesExhausted(count) => write!(f, "retry count {count} leaves no attempts"),
        }
    }
}

/// Failure of the credential store itself (a missing entry is not an error).
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

impl DeliveryError {
    /// Returns `true` if the event must be dropped.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Returns `true` if this failure consumes one retry attempt.
    #[must_use]
    pub const fn is_counted(&self) -> bool {
        matches!(self, Self::SendFailure(_))
    }

    /// Returns `true` for infrastructure failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_))
    }
}

impl From<RejectReason> for DeliveryError {
    fn from(reason: RejectReason) -> Self {
        Self::Rejected(reason)
    }
}

impl From<BrokerError> for DeliveryError {
    fn from(error: BrokerError) -> Self {
        Self::TransientInfra(error.to_string())
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::TransientInfra(error.to_string())
    }
}

impl From<CredentialError> for DeliveryError {
    fn from(error: CredentialError) -> Self {
        Self::TransientInfra(error.to_string())
    }
}
