//! Shared fixtures for delivery pipeline tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use courier_broker::{Broker, BrokerConfig, DelayMode, MemoryLog};
use courier_common::{DeliveryEvent, DeliveryRequest, ManualClock, ProviderKind};
use courier_delivery::{
    Components, CredentialSeed, Credentials, DeliveryConfig, DeliveryProcessor, EmailProvider,
    MemoryCredentialStore, ProviderRegistry, SendOutcome,
};
use courier_gates::MemoryCounterStore;
use parking_lot::Mutex;
use serde_json::json;

/// Provider that replays a script of outcomes, then repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<SendOutcome>>,
    fallback: SendOutcome,
    sent: Mutex<Vec<DeliveryEvent>>,
    accept_credentials: bool,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind, script: Vec<SendOutcome>, fallback: SendOutcome) -> Self {
        Self {
            kind,
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
            accept_credentials: true,
        }
    }

    pub fn succeeding(kind: ProviderKind) -> Self {
        Self::new(kind, Vec::new(), sent())
    }

    pub fn failing(kind: ProviderKind) -> Self {
        Self::new(kind, Vec::new(), failed())
    }

    pub fn rejecting_credentials(mut self) -> Self {
        self.accept_credentials = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent(&self) -> Vec<DeliveryEvent> {
        self.sent.lock().clone()
    }
}

pub fn sent() -> SendOutcome {
    SendOutcome::Sent {
        message_id: Some("msg-1".to_string()),
    }
}

pub fn failed() -> SendOutcome {
    SendOutcome::Failed {
        error: "upstream said no".to_string(),
    }
}

#[async_trait]
impl EmailProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(&self, event: &DeliveryEvent) -> SendOutcome {
        self.sent.lock().push(event.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn validate_credentials(&self, _credentials: &Credentials) -> bool {
        self.accept_credentials
    }
}

pub struct Harness {
    pub mode: DelayMode,
    pub config: DeliveryConfig,
    pub log: MemoryLog,
    pub clock: ManualClock,
    pub broker: Arc<Broker>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub counters: Arc<MemoryCounterStore>,
    pub gmail: Arc<ScriptedProvider>,
    pub outlook: Arc<ScriptedProvider>,
    pub processor: Arc<DeliveryProcessor>,
}

pub struct Setup {
    pub mode: DelayMode,
    pub config: DeliveryConfig,
    pub seeds: Vec<ProviderKind>,
    pub gmail: ScriptedProvider,
    pub outlook: ScriptedProvider,
    pub register_gmail: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            mode: DelayMode::Park,
            config: DeliveryConfig::default(),
            seeds: vec![ProviderKind::Gmail],
            gmail: ScriptedProvider::succeeding(ProviderKind::Gmail),
            outlook: ScriptedProvider::succeeding(ProviderKind::Outlook),
            register_gmail: true,
        }
    }
}

fn broker_over(log: &MemoryLog, clock: &ManualClock, mode: DelayMode) -> Arc<Broker> {
    let mut broker_config = BrokerConfig::default();
    broker_config.delay.mode = mode;
    broker_config.delay.poll_interval_ms = 10;
    broker_config.reader_backoff_ms = 10;
    Arc::new(Broker::new(
        Arc::new(log.clone()),
        Arc::new(clock.clone()),
        broker_config,
    ))
}

impl Setup {
    pub fn build(self) -> Harness {
        let log = MemoryLog::new(2);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let broker = broker_over(&log, &clock, self.mode);

        let seeds: Vec<CredentialSeed> = self
            .seeds
            .iter()
            .map(|provider| CredentialSeed {
                user_id: "u-1".to_string(),
                tenant_id: "acme".to_string(),
                provider: *provider,
                credentials: Credentials(json!({ "access_token": "token" })),
            })
            .collect();
        let credentials = Arc::new(MemoryCredentialStore::seeded(&seeds));
        let counters = Arc::new(MemoryCounterStore::new(Arc::new(clock.clone())));

        let gmail = Arc::new(self.gmail);
        let outlook = Arc::new(self.outlook);
        let mut providers = ProviderRegistry::new().with(outlook.clone());
        if self.register_gmail {
            providers = providers.with(gmail.clone());
        }

        let processor = Arc::new(DeliveryProcessor::new(
            Components {
                broker: Arc::clone(&broker),
                clock: Arc::new(clock.clone()),
                credentials: credentials.clone(),
                providers,
                counters: counters.clone(),
            },
            self.config.clone(),
        ));

        Harness {
            mode: self.mode,
            config: self.config,
            log,
            clock,
            broker,
            credentials,
            counters,
            gmail,
            outlook,
            processor,
        }
    }
}

/// A second worker over the same log, clock and stores.
pub struct Restarted {
    pub broker: Arc<Broker>,
    pub gmail: Arc<ScriptedProvider>,
    pub processor: Arc<DeliveryProcessor>,
}

impl Harness {
    /// Bring up a fresh broker and processor as a restarted process would.
    pub fn restart(&self, gmail: ScriptedProvider) -> Restarted {
        let broker = broker_over(&self.log, &self.clock, self.mode);
        let gmail = Arc::new(gmail);
        let processor = Arc::new(DeliveryProcessor::new(
            Components {
                broker: Arc::clone(&broker),
                clock: Arc::new(self.clock.clone()),
                credentials: self.credentials.clone(),
                providers: ProviderRegistry::new().with(gmail.clone()),
                counters: self.counters.clone(),
            },
            self.config.clone(),
        ));

        Restarted {
            broker,
            gmail,
            processor,
        }
    }

    pub fn quota_key(&self, provider: ProviderKind) -> String {
        format!("email:quota:acme:u-1:{provider}:2024-06-01")
    }

    /// Decoded events currently stored on `lane`.
    pub fn events(&self, lane: &str) -> Vec<DeliveryEvent> {
        self.log
            .records(lane)
            .iter()
            .map(|record| DeliveryEvent::from_payload(&record.payload).unwrap())
            .collect()
    }
}

pub fn request() -> DeliveryRequest {
    DeliveryRequest {
        tenant_id: "acme".to_string(),
        user_id: "u-1".to_string(),
        to_address: "user@example.com".to_string(),
        subject: "Hello".to_string(),
        body: "<p>Hi</p>".to_string(),
        ..Default::default()
    }
}

pub fn event(id: &str) -> DeliveryEvent {
    DeliveryEvent::from_request(
        DeliveryRequest {
            id: Some(id.to_string()),
            ..request()
        },
        Utc::now(),
    )
}

pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
