//! Error types for the broker adapter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The log could not be reached.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Appending to a lane failed.
    #[error("Failed to publish to lane {lane}: {reason}")]
    Publish { lane: String, reason: String },

    /// Registering or reading from a lane failed.
    #[error("Failed to consume from lane {lane}: {reason}")]
    Consume { lane: String, reason: String },

    /// An event could not be encoded for the wire.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker has been shut down.
    #[error("Broker is shut down")]
    Closed,

    /// Invalid broker configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BrokerError {
    /// Returns `true` if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Publish { .. } | Self::Consume { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Connection("refused".to_string()).is_transient());
        assert!(
            BrokerError::Publish {
                lane: "send-email-topic".to_string(),
                reason: "timeout".to_string(),
            }
            .is_transient()
        );
        assert!(!BrokerError::Closed.is_transient());
        assert!(!BrokerError::Configuration("bad".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let error = BrokerError::Publish {
            lane: "failed-email-topic".to_string(),
            reason: "broker down".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to publish to lane failed-email-topic: broker down"
        );
    }
}
