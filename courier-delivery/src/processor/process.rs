//! One processing attempt for one event

use std::time::Duration;

use courier_common::{DeliveryEvent, ProviderKind, delivery};
use tracing::{error, info, warn};

use super::{DeliveryOutcome, DeliveryProcessor, DeliveryStage};
use crate::{DeliveryError, RejectReason, SendOutcome, validate_subject};

fn enter(event: &DeliveryEvent, stage: DeliveryStage) {
    delivery!("{} entered {stage:?}", event.id);
}

impl DeliveryProcessor {
    /// Run `event` through the pipeline and settle the result.
    ///
    /// Throttled, transient and send failures are requeued (or dead-lettered)
    /// here; the returned outcome says which.
    ///
    /// # Errors
    ///
    /// Only when an infrastructure failure could not even be requeued.
    pub async fn process(&self, mut event: DeliveryEvent) -> Result<DeliveryOutcome, DeliveryError> {
        info!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            user_id = %event.user_id,
            retry_count = event.retry_count,
            "Processing email from lane"
        );
        enter(&event, DeliveryStage::Received);

        if let Some(ledger) = &self.ledger
            && ledger.contains(&event).await
        {
            info!(event_id = %event.id, "Already sent, acknowledging duplicate");
            return Ok(DeliveryOutcome::Duplicate);
        }

        let settled = match self.attempt(&mut event).await {
            Ok(message_id) => Ok(self.settle_sent(&event, message_id).await),
            Err(failure) => self.settle_failure(&mut event, failure).await,
        };

        match settled {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.recover(&event, &e).await,
        }
    }

    /// Walk the stages up to and including the provider send.
    async fn attempt(&self, event: &mut DeliveryEvent) -> Result<Option<String>, DeliveryError> {
        // Addresses are delivered exactly as given.
        enter(event, DeliveryStage::Resolved);

        self.validator.validate(&event.to_address)?;
        validate_subject(&event.subject)?;
        enter(event, DeliveryStage::Validated);

        let provider = self.select_provider(event).await?;
        event.provider = Some(provider);
        enter(event, DeliveryStage::ProviderSelected);

        if !self
            .quota
            .check(&event.user_id, &event.tenant_id, provider)
            .await
        {
            return Err(DeliveryError::Throttled { provider });
        }
        enter(event, DeliveryStage::QuotaChecked);

        let sender = self.providers.get(provider).ok_or_else(|| {
            DeliveryError::TransientInfra(format!("provider {provider} is not registered"))
        })?;

        match sender.send(event).await {
            SendOutcome::Sent { message_id } => Ok(message_id),
            SendOutcome::Failed { error } => Err(DeliveryError::SendFailure(error)),
        }
    }

    /// First provider in priority order holding credentials for the sender.
    async fn select_provider(&self, event: &DeliveryEvent) -> Result<ProviderKind, DeliveryError> {
        for provider in ProviderKind::PRIORITY {
            if self
                .credentials
                .get(&event.user_id, &event.tenant_id, provider)
                .await?
                .is_some()
            {
                return Ok(provider);
            }
        }

        Err(RejectReason::NoCredentials.into())
    }

    async fn settle_sent(&self, event: &DeliveryEvent, message_id: Option<String>) -> DeliveryOutcome {
        if let Some(provider) = event.provider {
            self.quota
                .record_sent(&event.user_id, &event.tenant_id, provider)
                .await;
        }
        if let Some(ledger) = &self.ledger {
            ledger.record(event).await;
        }

        self.audit.sent(event, message_id.as_deref());
        enter(event, DeliveryStage::Sent);

        DeliveryOutcome::Sent {
            message_id,
            retry_count: event.retry_count,
        }
    }

    async fn settle_failure(
        &self,
        event: &mut DeliveryEvent,
        failure: DeliveryError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        delivery!(
            "{} attempt failed (permanent: {}, counted: {})",
            event.id,
            failure.is_permanent(),
            failure.is_counted()
        );

        match failure {
            DeliveryError::Rejected(reason) => {
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    user_id = %event.user_id,
                    reason = %reason,
                    "Dropping undeliverable email"
                );
                self.audit.rejected(event, &reason.to_string());
                enter(event, DeliveryStage::Rejected);
                Ok(DeliveryOutcome::Rejected(reason))
            }
            DeliveryError::Throttled { provider } => {
                warn!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    user_id = %event.user_id,
                    provider = %provider,
                    "Email quota exceeded, requeueing with delay"
                );
                let reason = format!("daily quota exhausted for {provider}");
                self.requeue(event, self.policy.throttle_delay(), &reason)
                    .await
            }
            DeliveryError::SendFailure(error) => {
                event.retry_count += 1;
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    user_id = %event.user_id,
                    provider = event.provider.map_or("none", ProviderKind::as_str),
                    retry_count = event.retry_count,
                    remaining = self.policy.remaining_attempts(event.retry_count),
                    error = %error,
                    "Failed to send email"
                );

                if self.policy.should_retry(event.retry_count) {
                    let delay = self.policy.backoff_delay(event.retry_count);
                    self.requeue(event, delay, &error).await
                } else {
                    self.dead_letter(event, &error).await
                }
            }
            transient @ DeliveryError::TransientInfra(_) => Err(transient),
        }
    }

    async fn requeue(
        &self,
        event: &DeliveryEvent,
        delay: Duration,
        reason: &str,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.broker
            .requeue_with_delay(&self.lanes.main, event, Some(&event.id), delay)
            .await?;

        self.audit.retry(event, reason, delay.as_secs());
        enter(event, DeliveryStage::RetryScheduled);

        Ok(DeliveryOutcome::RetryScheduled {
            delay,
            retry_count: event.retry_count,
        })
    }

    async fn dead_letter(
        &self,
        event: &DeliveryEvent,
        error: &str,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        warn!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            user_id = %event.user_id,
            retry_count = event.retry_count,
            "Max retries reached, moving to dead-letter lane"
        );

        self.broker
            .publish(&self.lanes.dead_letter, event, Some(&event.id))
            .await?;

        self.audit.dead_lettered(event, error);
        enter(event, DeliveryStage::DeadLettered);

        Ok(DeliveryOutcome::DeadLettered {
            retry_count: event.retry_count,
        })
    }

    /// Last resort for anything that went wrong above: try again after the
    /// transient delay without counting an attempt.
    ///
    /// An event whose attempts are exhausted goes to the dead-letter lane
    /// (through its delay lane) instead, never back to the main lane.
    async fn recover(
        &self,
        event: &DeliveryEvent,
        failure: &DeliveryError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        error!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            user_id = %event.user_id,
            provider = event.provider.map_or("none", ProviderKind::as_str),
            retry_count = event.retry_count,
            error = %failure,
            "Error processing email"
        );

        let lane = if self.policy.should_retry(event.retry_count) {
            &self.lanes.main
        } else {
            &self.lanes.dead_letter
        };
        let delay = self.policy.transient_delay();

        self.broker
            .requeue_with_delay(lane, event, Some(&event.id), delay)
            .await
            .inspect_err(|e| {
                error!(
                    event_id = %event.id,
                    lane = %lane,
                    error = %e,
                    "Failed to requeue after error"
                );
            })?;

        self.audit.retry(event, &failure.to_string(), delay.as_secs());
        enter(event, DeliveryStage::RetryScheduled);

        Ok(DeliveryOutcome::RetryScheduled {
            delay,
            retry_count: event.retry_count,
        })
    }
}
