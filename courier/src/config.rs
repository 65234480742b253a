//! Configuration loading
//!
//! The whole worker is described by one RON document:
//!
//! ```ron
//! Courier(
//!     http: (listen_address: "127.0.0.1:8080"),
//!     broker: (backend: Memory(partitions: 3)),
//!     store: Redis(url: "redis://127.0.0.1:6379"),
//!     delivery: (retry: (max_retries: 5, backoff_base: 5)),
//!     credentials: [
//!         (
//!             user_id: "u-1",
//!             tenant_id: "acme",
//!             provider: gmail,
//!             credentials: {"access_token": "ya29..."},
//!         ),
//!     ],
//! )
//! ```

use std::path::{Path, PathBuf};

use courier_broker::BrokerConfig;
use courier_delivery::{CredentialSeed, DeliveryConfig, ProviderConfig};
use courier_gates::{RateLimitConfig, StoreConfig};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "COURIER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("COURIER_CONFIG points to non-existent file: {}", .0.display())]
    MissingEnvFile(PathBuf),

    #[error("Config file does not exist: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("No configuration file found. Tried:\n{tried}")]
    NotFound { tried: String },
}

/// HTTP ingress: `/email/send` and the `/credentials` endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Serve HTTP ingress alongside the worker
    ///
    /// Default: true
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    /// Address to bind, e.g. `[::]:8080` or `127.0.0.1:8080`
    ///
    /// Default: `[::]:8080`
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upper bound on one request (in seconds)
    ///
    /// Default: 10
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_http_enabled() -> bool {
    true
}

fn default_listen_address() -> String {
    "[::]:8080".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            listen_address: default_listen_address(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// Counter store shared by the quota gate, rate limiter and sent-ledger
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default, alias = "provider")]
    pub providers: ProviderConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Credentials loaded into the in-process credential store at startup
    #[serde(default, alias = "credential")]
    pub credentials: Vec<CredentialSeed>,
}

impl Courier {
    /// Parse a RON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not a valid config.
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    /// Read and parse the config at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&content)
    }
}

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. `explicit` (the `--config` flag)
/// 2. `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Fails if an explicitly named file is missing or nothing is found.
pub fn find_config_file(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    locate(
        explicit,
        std::env::var(CONFIG_ENV).ok().map(PathBuf::from),
        &default_paths(),
    )
}

fn locate(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path)
        } else {
            Err(ConfigError::MissingFile(path))
        };
    }

    if let Some(path) = from_env {
        return if path.exists() {
            Ok(path)
        } else {
            Err(ConfigError::MissingEnvFile(path))
        };
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let tried = std::iter::once(format!("  - {CONFIG_ENV} environment variable"))
        .chain(defaults.iter().map(|p| format!("  - {}", p.display())))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound { tried })
}
