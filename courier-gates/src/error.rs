use thiserror::Error;

/// Failure talking to the counter store.
///
/// Every gate treats these as "allow": a store outage must not stop mail.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// A key held something that is not a counter.
    #[error("Key {key} holds a non-integer value")]
    NotACounter { key: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Returns `true` if retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::NotACounter { .. } => false,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
        }
    }
}
