//! Types shared by every courier crate.
//!
//! - [`DeliveryEvent`]: the unit of work that travels through the broker
//! - [`ProviderKind`]: the closed set of email providers
//! - [`Clock`]: the time source used for expiry, buckets and delays
//! - [`logging`] and [`audit`]: the ambient tracing setup

pub mod audit;
pub mod clock;
pub mod event;
pub mod logging;
pub mod provider;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{DeliveryEvent, DeliveryRequest};
pub use provider::{ProviderKind, UnknownProvider};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
