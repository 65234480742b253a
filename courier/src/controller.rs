use std::sync::Arc;

use courier_broker::{Broker, BrokerError};
use courier_common::{Clock, DeliveryEvent, DeliveryRequest, Signal, SystemClock, internal, logging};
use courier_delivery::{
    Components, CredentialStore, DeliveryError, DeliveryProcessor, MemoryCredentialStore,
    ProviderRegistry,
};
use courier_gates::{RateLimiter, StoreError};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{Courier, IngressServer};

/// Rate-limit endpoint name for ingress.
pub const ENQUEUE_ENDPOINT: &str = "enqueue";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to start broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to connect counter store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build provider clients: {0}")]
    Providers(String),
}

/// Whether an ingress request made it onto the main lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued(DeliveryEvent),
    RateLimited,
}

/// The wired-up worker: broker, processor, credential store and ingress
/// limiter.
#[derive(Debug)]
pub struct Pipeline {
    broker: Arc<Broker>,
    processor: Arc<DeliveryProcessor>,
    credentials: Arc<dyn CredentialStore>,
    limiter: RateLimiter,
}

impl Pipeline {
    #[must_use]
    pub const fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    #[must_use]
    pub const fn processor(&self) -> &Arc<DeliveryProcessor> {
        &self.processor
    }

    #[must_use]
    pub const fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Admit `request` through the rate limiter and queue it.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be published.
    pub async fn enqueue(&self, request: DeliveryRequest) -> Result<Admission, DeliveryError> {
        if self
            .limiter
            .check(&request.user_id, &request.tenant_id, ENQUEUE_ENDPOINT)
            .await
        {
            tracing::warn!(
                tenant_id = %request.tenant_id,
                user_id = %request.user_id,
                "Rejecting enqueue, rate limit exceeded"
            );
            return Ok(Admission::RateLimited);
        }

        Ok(Admission::Queued(self.processor.enqueue(request).await?))
    }

    /// Process the main lane until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be started.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        Arc::clone(&self.processor).serve(shutdown).await
    }
}

async fn shutdown(signals: broadcast::Sender<Signal>) -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = signals.subscribe();

    signals
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Courier {
    /// Connect every backend and wire the processor.
    ///
    /// # Errors
    ///
    /// Fails if the broker, counter store or provider clients cannot be set up.
    pub async fn build(&self, clock: Arc<dyn Clock>) -> Result<Pipeline, StartupError> {
        let backend = self.broker.backend.build()?;
        let broker = Arc::new(Broker::new(backend, Arc::clone(&clock), self.broker.clone()));

        let counters = self.store.build(Arc::clone(&clock)).await?;

        let credentials: Arc<dyn CredentialStore> =
            Arc::new(MemoryCredentialStore::seeded(&self.credentials));
        let providers = ProviderRegistry::from_config(&self.providers, &credentials)
            .map_err(|e| StartupError::Providers(e.to_string()))?;

        internal!(
            level = INFO,
            "Providers registered: {:?}, {} credential entries loaded",
            providers.kinds(),
            self.credentials.len()
        );

        let limiter = RateLimiter::new(
            Arc::clone(&counters),
            Arc::clone(&clock),
            self.rate_limit.clone(),
        );

        let processor = Arc::new(DeliveryProcessor::new(
            Components {
                broker: Arc::clone(&broker),
                clock,
                credentials: Arc::clone(&credentials),
                providers,
                counters,
            },
            self.delivery.clone(),
        ));

        Ok(Pipeline {
            broker,
            processor,
            credentials,
            limiter,
        })
    }

    /// Run the worker, and HTTP ingress when enabled, until CTRL+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// This function will return an error if any backend fails to initialise.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let pipeline = Arc::new(self.build(Arc::new(SystemClock)).await?);
        let server = if self.http.enabled {
            Some(IngressServer::new(&self.http, Arc::clone(&pipeline)).await?)
        } else {
            None
        };

        internal!("Controller running");

        let (signals, _receiver) = broadcast::channel(64);
        let ingress = server.map(|server| tokio::spawn(server.serve(signals.subscribe())));

        let ret = tokio::select! {
            r = pipeline.serve(signals.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown(signals.clone()) => {
                r
            }
        };

        internal!("Shutting down...");

        if let Some(ingress) = ingress {
            let _ = signals.send(Signal::Shutdown);
            match ingress.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("HTTP ingress failed: {e}"),
                Err(e) => tracing::error!("HTTP ingress task ended abnormally: {e}"),
            }
        }

        ret
    }
}
