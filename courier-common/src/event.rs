//! The delivery event and its ingress form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ProviderKind;

/// A request to deliver one email, as accepted at ingress.
///
/// Everything the pipeline can derive on its own (`id`, `retry_count`,
/// `created_at`) is optional here and filled in by [`DeliveryEvent::from_request`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tenant_id: String,
    pub user_id: String,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// The unit of work owned by the broker while enqueued and by the
/// orchestrator for the duration of one processing attempt.
///
/// Serialized as camelCase JSON on every lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub to_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Epoch milliseconds after which a delay lane may forward this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_after: Option<i64>,
}

impl DeliveryEvent {
    /// Fill ingress defaults: a fresh ULID when no id was supplied, a zero
    /// retry count, and `now` as the creation time.
    #[must_use]
    pub fn from_request(request: DeliveryRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Ulid::new().to_string()),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            to_address: request.to_address,
            provider: None,
            subject: request.subject,
            body: request.body,
            retry_count: request.retry_count.unwrap_or(0),
            created_at: request.created_at.unwrap_or(now),
            process_after: None,
        }
    }

    /// Whether a delay lane holding this event may release it at `now_millis`.
    ///
    /// An event without a `process_after` stamp is always due.
    #[must_use]
    pub fn is_due(&self, now_millis: i64) -> bool {
        self.process_after.is_none_or(|after| now_millis >= after)
    }

    /// Milliseconds left until the event is due, zero when already due.
    #[must_use]
    pub fn millis_until_due(&self, now_millis: i64) -> u64 {
        self.process_after
            .map_or(0, |after| u64::try_from(after - now_millis).unwrap_or(0))
    }

    /// Serialize to the lane wire format.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the lane wire format.
    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            tenant_id: "acme".to_string(),
            user_id: "u-1".to_string(),
            to_address: "user@example.com".to_string(),
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_request_fills_defaults() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = DeliveryEvent::from_request(request(), now);

        assert!(Ulid::from_string(&event.id).is_ok());
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.created_at, now);
        assert_eq!(event.provider, None);
        assert_eq!(event.process_after, None);
    }

    #[test]
    fn test_from_request_keeps_supplied_values() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap();
        let event = DeliveryEvent::from_request(
            DeliveryRequest {
                id: Some("evt-7".to_string()),
                retry_count: Some(2),
                created_at: Some(earlier),
                ..request()
            },
            now,
        );

        assert_eq!(event.id, "evt-7");
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.created_at, earlier);
    }

    #[test]
    fn test_empty_id_is_replaced() {
        let event = DeliveryEvent::from_request(
            DeliveryRequest {
                id: Some(String::new()),
                ..request()
            },
            Utc::now(),
        );
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let mut event = DeliveryEvent::from_request(request(), Utc::now());
        event.provider = Some(ProviderKind::Gmail);
        event.process_after = Some(1_000);

        let json: serde_json::Value =
            serde_json::from_slice(&event.to_payload().expect("serialize")).expect("json");
        assert_eq!(json["toAddress"], "user@example.com");
        assert_eq!(json["tenantId"], "acme");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["provider"], "gmail");
        assert_eq!(json["processAfter"], 1_000);

        event.process_after = None;
        let json: serde_json::Value =
            serde_json::from_slice(&event.to_payload().expect("serialize")).expect("json");
        assert!(json.get("processAfter").is_none());
    }

    #[test]
    fn test_due_calculation() {
        let mut event = DeliveryEvent::from_request(request(), Utc::now());
        assert!(event.is_due(0));
        assert_eq!(event.millis_until_due(0), 0);

        event.process_after = Some(5_000);
        assert!(!event.is_due(4_999));
        assert!(event.is_due(5_000));
        assert_eq!(event.millis_until_due(3_000), 2_000);
        assert_eq!(event.millis_until_due(9_000), 0);
    }
}
