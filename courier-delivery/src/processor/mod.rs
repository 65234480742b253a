//! Delivery processor orchestration

mod process;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_broker::{Broker, EventHandler, HandlerError, LaneConfig};
use courier_common::{
    Clock, DeliveryEvent, DeliveryRequest, ProviderKind, Signal,
    audit::{Audit, AuditConfig},
    internal,
};
use courier_gates::{CounterStore, QuotaConfig, QuotaGate};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    AddressValidator, CredentialStore, Credentials, DeliveryError, ProviderRegistry,
    RejectReason, RetryPolicy, ValidatorConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Remember successful sends for this long (in seconds) and acknowledge
    /// redelivered events with a remembered id without sending them again.
    ///
    /// Default: None (every delivery is attempted)
    #[serde(default)]
    pub dedup_ttl_secs: Option<u64>,
}

/// Where an event is in its processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStage {
    Received,
    Resolved,
    Validated,
    ProviderSelected,
    QuotaChecked,
    Sent,
    RetryScheduled,
    DeadLettered,
    Rejected,
}

/// How one processing attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent {
        message_id: Option<String>,
        retry_count: u32,
    },
    RetryScheduled {
        delay: Duration,
        retry_count: u32,
    },
    DeadLettered {
        retry_count: u32,
    },
    Rejected(RejectReason),
    /// Already delivered according to the sent-ledger.
    Duplicate,
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn stage(&self) -> DeliveryStage {
        match self {
            Self::Sent { .. } | Self::Duplicate => DeliveryStage::Sent,
            Self::RetryScheduled { .. } => DeliveryStage::RetryScheduled,
            Self::DeadLettered { .. } => DeliveryStage::DeadLettered,
            Self::Rejected(_) => DeliveryStage::Rejected,
        }
    }
}

/// Everything the processor talks to.
#[derive(Debug, Clone)]
pub struct Components {
    pub broker: Arc<Broker>,
    pub clock: Arc<dyn Clock>,
    pub credentials: Arc<dyn CredentialStore>,
    pub providers: ProviderRegistry,
    pub counters: Arc<dyn CounterStore>,
}

/// Successful sends, keyed `email:sent:{id}`.
#[derive(Debug)]
struct SentLedger {
    store: Arc<dyn CounterStore>,
    ttl: Duration,
}

impl SentLedger {
    fn key(event: &DeliveryEvent) -> String {
        format!("email:sent:{}", event.id)
    }

    async fn contains(&self, event: &DeliveryEvent) -> bool {
        match self.store.get(&Self::key(event)).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Sent-ledger lookup failed, delivering anyway");
                false
            }
        }
    }

    async fn record(&self, event: &DeliveryEvent) {
        if let Err(e) = self.store.set_ex(&Self::key(event), 1, self.ttl).await {
            warn!(event_id = %event.id, error = %e, "Failed to record send in sent-ledger");
        }
    }
}

/// Consumes the main lane and settles every event as sent, retried,
/// dead-lettered or rejected.
#[derive(Debug)]
pub struct DeliveryProcessor {
    broker: Arc<Broker>,
    clock: Arc<dyn Clock>,
    credentials: Arc<dyn CredentialStore>,
    providers: ProviderRegistry,
    quota: QuotaGate,
    validator: AddressValidator,
    ledger: Option<SentLedger>,
    policy: RetryPolicy,
    lanes: LaneConfig,
    audit: Audit,
}

impl DeliveryProcessor {
    #[must_use]
    pub fn new(components: Components, config: DeliveryConfig) -> Self {
        let Components {
            broker,
            clock,
            credentials,
            providers,
            counters,
        } = components;

        let ledger = config.dedup_ttl_secs.map(|secs| SentLedger {
            store: Arc::clone(&counters),
            ttl: Duration::from_secs(secs),
        });
        let lanes = broker.config().lanes.clone();

        Self {
            quota: QuotaGate::new(counters, Arc::clone(&clock), config.quota),
            validator: AddressValidator::new(&config.validator),
            audit: Audit::new(config.audit),
            policy: config.retry,
            broker,
            clock,
            credentials,
            providers,
            ledger,
            lanes,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn lanes(&self) -> &LaneConfig {
        &self.lanes
    }

    /// Accept a request at ingress and publish it to the main lane, keyed by
    /// its id.
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::RetriesExhausted`] for a request whose retry
    /// count leaves no attempts, and [`DeliveryError::TransientInfra`] if the
    /// publish fails.
    pub async fn enqueue(&self, request: DeliveryRequest) -> Result<DeliveryEvent, DeliveryError> {
        if let Some(retry_count) = request.retry_count
            && !self.policy.should_retry(retry_count)
        {
            warn!(
                tenant_id = %request.tenant_id,
                user_id = %request.user_id,
                retry_count,
                max_retries = self.policy.max_retries,
                "Refusing request with no attempts left"
            );
            return Err(RejectReason::RetriesExhausted(retry_count).into());
        }

        let event = DeliveryEvent::from_request(request, self.clock.now());

        info!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            user_id = %event.user_id,
            "Queueing email for sending"
        );

        self.broker
            .publish(&self.lanes.main, &event, Some(&event.id))
            .await?;
        self.audit.queued(&event);

        Ok(event)
    }

    /// Store `credentials` for `provider` if the provider accepts them.
    ///
    /// Returns `false` when the provider rejected them; nothing is stored then.
    ///
    /// # Errors
    ///
    /// Fails if the provider is not registered or the store is unavailable.
    pub async fn register_credentials(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
        credentials: Credentials,
    ) -> Result<bool, DeliveryError> {
        let sender = self.providers.get(provider).ok_or_else(|| {
            DeliveryError::TransientInfra(format!("provider {provider} is not registered"))
        })?;

        if !sender.validate_credentials(&credentials).await {
            warn!(user_id = %user, tenant_id = %tenant, provider = %provider, "Credentials rejected by provider");
            return Ok(false);
        }

        self.credentials
            .store(user, tenant, provider, credentials)
            .await?;
        Ok(true)
    }

    /// Start consuming the main lane, and reattach a reader to every delay
    /// lane this processor can requeue to so events left there by an earlier
    /// run are still forwarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be registered.
    pub async fn start(self: &Arc<Self>) -> Result<(), DeliveryError> {
        let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        self.broker
            .consume(&self.lanes.main, &self.lanes.group_id, handler)
            .await?;

        let resumed = self
            .broker
            .resume_delay_lanes(&self.lanes.main, self.policy.main_lane_delays())
            + self
                .broker
                .resume_delay_lanes(&self.lanes.dead_letter, [self.policy.transient_delay()]);
        internal!("Reattached {resumed} delay lane readers");

        Ok(())
    }

    /// Consume until a shutdown signal arrives, then stop every reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be registered.
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");
        self.start().await?;

        match shutdown.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Delivery processor received shutdown signal");
            }
            Err(e) => {
                error!("Delivery processor shutdown channel error: {e}");
            }
        }

        self.broker.shutdown().await;
        internal!("Delivery processor shutdown complete");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DeliveryProcessor {
    async fn handle(&self, event: DeliveryEvent) -> Result<(), HandlerError> {
        let event_id = event.id.clone();
        let outcome = self.process(event).await?;
        debug!(event_id = %event_id, stage = ?outcome.stage(), "Delivery attempt settled");
        Ok(())
    }
}
