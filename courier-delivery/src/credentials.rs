//! Credential store interface
//!
//! Credentials are an opaque JSON blob per `(user, tenant, provider)`. Only the
//! provider that owns them interprets the contents; the pipeline only asks
//! whether they exist.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use courier_common::ProviderKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::CredentialError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

impl Credentials {
    /// OAuth bearer token, accepting both `access_token` and `accessToken`.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        ["access_token", "accessToken"]
            .iter()
            .find_map(|field| self.0.get(field).and_then(serde_json::Value::as_str))
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync + Debug {
    async fn get(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credentials>, CredentialError>;

    /// Insert or replace.
    async fn store(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
        credentials: Credentials,
    ) -> Result<(), CredentialError>;

    /// Returns `true` if an entry was removed.
    async fn delete(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
    ) -> Result<bool, CredentialError>;

    /// Providers `user` has credentials for in `tenant`, in selection order.
    async fn list_providers(
        &self,
        user: &str,
        tenant: &str,
    ) -> Result<Vec<ProviderKind>, CredentialError>;
}

/// One credential entry supplied through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSeed {
    pub user_id: String,
    pub tenant_id: String,
    pub provider: ProviderKind,
    pub credentials: Credentials,
}

type Key = (String, String, ProviderKind);

fn key(user: &str, tenant: &str, provider: ProviderKind) -> Key {
    (user.to_string(), tenant.to_string(), provider)
}

/// In-process credential store
#[derive(Debug)]
pub struct MemoryCredentialStore {
    entries: DashMap<Key, Credentials>,
    available: AtomicBool,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn seeded(seeds: &[CredentialSeed]) -> Self {
        let store = Self::new();
        for seed in seeds {
            store.entries.insert(
                key(&seed.user_id, &seed.tenant_id, seed.provider),
                seed.credentials.clone(),
            );
        }
        info!(count = seeds.len(), "Loaded credential seeds");
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), CredentialError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CredentialError::Unavailable(
                "memory credential store switched off".to_string(),
            ))
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credentials>, CredentialError> {
        self.ensure_available()?;

        let found = self
            .entries
            .get(&key(user, tenant, provider))
            .map(|entry| entry.value().clone());
        if found.is_none() {
            debug!(user_id = %user, tenant_id = %tenant, provider = %provider, "No credentials found");
        }
        Ok(found)
    }

    async fn store(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
        credentials: Credentials,
    ) -> Result<(), CredentialError> {
        self.ensure_available()?;

        self.entries.insert(key(user, tenant, provider), credentials);
        info!(user_id = %user, tenant_id = %tenant, provider = %provider, "Credentials stored");
        Ok(())
    }

    async fn delete(
        &self,
        user: &str,
        tenant: &str,
        provider: ProviderKind,
    ) -> Result<bool, CredentialError> {
        self.ensure_available()?;

        Ok(self.entries.remove(&key(user, tenant, provider)).is_some())
    }

    async fn list_providers(
        &self,
        user: &str,
        tenant: &str,
    ) -> Result<Vec<ProviderKind>, CredentialError> {
        self.ensure_available()?;

        Ok(ProviderKind::PRIORITY
            .into_iter()
            .filter(|provider| self.entries.contains_key(&key(user, tenant, *provider)))
            .collect())
    }
}
