//! The courier worker: configuration, wiring, HTTP ingress and shutdown.

pub mod config;
pub mod controller;
pub mod server;

pub use config::{ConfigError, Courier, HttpConfig};
pub use controller::{Admission, Pipeline, StartupError};
pub use server::{IngressServer, ServerError};
