//! Audit logging for delivery lifecycle events
//!
//! Every terminal or retry decision the orchestrator makes is written as one
//! structured `tracing` event carrying enough context (event id, tenant, user,
//! provider, attempt count) to replay it by hand from the dead-letter lane.
//!
//! Records go to the `courier::audit` target, tagged with an `audit` field:
//! `queued`, `sent`, `retry`, `dead_lettered` or `rejected`. Recipient
//! addresses can be redacted through [`AuditConfig`].

use serde::{Deserialize, Serialize};

use crate::DeliveryEvent;

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging for delivery lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact the local part of recipient addresses
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Replace the local part of `email` when `redact` is set.
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    match (redact, email.split_once('@')) {
        (false, _) => email.to_string(),
        (true, Some((_, domain))) => format!("[REDACTED]@{domain}"),
        (true, None) => "[REDACTED]".to_string(),
    }
}

/// Emit one audit record at `$level` with the identity fields every record
/// carries, followed by the record-specific fields.
macro_rules! audit {
    ($level:ident, $kind:literal, $event:expr, $($field:tt)*) => {
        tracing::event!(
            target: "courier::audit",
            tracing::Level::$level,
            audit = $kind,
            event_id = %$event.id,
            tenant_id = %$event.tenant_id,
            user_id = %$event.user_id,
            $($field)*
        )
    };
}

/// Audit sink owned by the component that emits the records.
///
/// A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct Audit {
    config: AuditConfig,
}

impl Audit {
    #[must_use]
    pub const fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    fn recipient(&self, event: &DeliveryEvent) -> String {
        redact_email(&event.to_address, self.config.redact_recipients)
    }

    fn provider(event: &DeliveryEvent) -> &'static str {
        event.provider.map_or("none", crate::ProviderKind::as_str)
    }

    pub fn queued(&self, event: &DeliveryEvent) {
        if self.config.enabled {
            audit!(INFO, "queued", event,
                recipient = %self.recipient(event),
                "Audit: Delivery queued"
            );
        }
    }

    pub fn sent(&self, event: &DeliveryEvent, message_id: Option<&str>) {
        if self.config.enabled {
            audit!(INFO, "sent", event,
                provider = Self::provider(event),
                recipient = %self.recipient(event),
                retry_count = event.retry_count,
                message_id = message_id.unwrap_or("-"),
                "Audit: Delivery successful"
            );
        }
    }

    pub fn retry(&self, event: &DeliveryEvent, reason: &str, delay_secs: u64) {
        if self.config.enabled {
            audit!(INFO, "retry", event,
                provider = Self::provider(event),
                retry_count = event.retry_count,
                reason = %reason,
                delay_secs,
                "Audit: Delivery requeued"
            );
        }
    }

    pub fn dead_lettered(&self, event: &DeliveryEvent, error: &str) {
        if self.config.enabled {
            audit!(WARN, "dead_lettered", event,
                provider = Self::provider(event),
                recipient = %self.recipient(event),
                retry_count = event.retry_count,
                error = %error,
                "Audit: Delivery moved to dead-letter lane"
            );
        }
    }

    pub fn rejected(&self, event: &DeliveryEvent, reason: &str) {
        if self.config.enabled {
            audit!(WARN, "rejected", event,
                recipient = %self.recipient(event),
                reason = %reason,
                "Audit: Delivery rejected"
            );
        }
    }
}
