//! Email providers
//!
//! Each provider is a capability with two operations, `send` and
//! `validate_credentials`. The set of providers is fixed at startup in a
//! [`ProviderRegistry`] and dispatch is a map lookup on [`ProviderKind`].

mod gmail;
mod outlook;

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{DeliveryEvent, ProviderKind};
use serde::{Deserialize, Serialize};

pub use self::{gmail::GmailProvider, outlook::OutlookProvider};
use crate::{CredentialStore, Credentials};

/// Result of one send, with provider errors flattened to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: Option<String> },
    Failed { error: String },
}

impl SendOutcome {
    pub(crate) fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync + Debug {
    fn kind(&self) -> ProviderKind;

    /// Deliver `event`. Never errors: every failure becomes
    /// [`SendOutcome::Failed`].
    async fn send(&self, event: &DeliveryEvent) -> SendOutcome;

    /// Whether `credentials` are accepted by the provider.
    async fn validate_credentials(&self, credentials: &Credentials) -> bool;
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_gmail_base_url() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_outlook_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Per-request timeout for provider HTTP calls (in seconds)
    ///
    /// Default: 30
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_gmail_base_url")]
    pub gmail_base_url: String,

    #[serde(default = "default_outlook_base_url")]
    pub outlook_base_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            gmail_base_url: default_gmail_base_url(),
            outlook_base_url: default_outlook_base_url(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn EmailProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table: Gmail and Outlook over HTTPS.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(
        config: &ProviderConfig,
        credentials: &Arc<dyn CredentialStore>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self::new()
            .with(Arc::new(GmailProvider::new(
                client.clone(),
                &config.gmail_base_url,
                Arc::clone(credentials),
            )))
            .with(Arc::new(OutlookProvider::new(
                client,
                &config.outlook_base_url,
                Arc::clone(credentials),
            ))))
    }

    /// Register `provider` under its own kind, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn EmailProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    #[must_use]
    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn EmailProvider>> {
        self.providers.get(&kind)
    }

    /// Registered kinds in selection order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::PRIORITY
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }
}

/// Fetch the bearer token `provider` should use for `event`.
pub(crate) async fn bearer_token(
    credentials: &dyn CredentialStore,
    provider: ProviderKind,
    event: &DeliveryEvent,
) -> Result<String, SendOutcome> {
    let found = credentials
        .get(&event.user_id, &event.tenant_id, provider)
        .await
        .map_err(SendOutcome::failed)?
        .ok_or_else(|| SendOutcome::failed(format!("No credentials found for {provider}")))?;

    found
        .access_token()
        .map(str::to_string)
        .ok_or_else(|| SendOutcome::failed(format!("{provider} credentials carry no access token")))
}
