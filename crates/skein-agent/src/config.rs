//! Agent configuration loaded from a TOML file, with defaults.

use serde::Deserialize;
use skein_engine::RetryConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Who this agent is on the wire.
    pub identity: IdentityConfig,
    /// Record store backend.
    pub storage: StorageConfig,
    /// Outbound queue and retry tuning.
    pub outbound: OutboundConfig,
    /// Mediator role, off by default.
    pub mediator: MediatorSection,
    /// Logging.
    pub log: LogConfig,
}

/// Identity this agent presents to peers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display label sent in invitations and requests.
    pub label: String,
    /// Our DID.
    pub did: String,
    /// Our reachable endpoint, absent for mediated-only agents.
    pub endpoint: Option<String>,
    /// Our recipient keys, first key used as the default sender key.
    pub recipient_keys: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            label: "Skein Agent".to_string(),
            did: "did:peer:local".to_string(),
            endpoint: None,
            recipient_keys: Vec::new(),
        }
    }
}

/// Which record store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// In-memory, lost on restart.
    #[default]
    Memory,
    /// SQLite at `storage.path`.
    Sqlite,
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind.
    pub backend: StorageBackend,
    /// Database path, required for the sqlite backend.
    pub path: Option<PathBuf>,
}

/// Outbound delivery tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Pending-send queue capacity.
    pub queue_capacity: usize,
    /// Per-attempt send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Retry budget and backoff.
    pub retry: RetrySection,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            send_timeout_ms: 10_000,
            retry: RetrySection::default(),
        }
    }
}

/// Retry settings, mirroring [`RetryConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Maximum attempts including the first try.
    pub max_attempts: u32,
    /// Minimum backoff in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum backoff in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor applied to each backoff.
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            min_delay_ms: defaults.min_delay_ms,
            max_delay_ms: defaults.max_delay_ms,
            jitter: defaults.jitter,
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            min_delay_ms: section.min_delay_ms,
            max_delay_ms: section.max_delay_ms,
            jitter: section.jitter,
        }
    }
}

/// Mediator role settings. When enabled, this agent accepts mediation
/// requests and routes for its recipients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediatorSection {
    /// Whether to register the mediator handlers.
    pub enabled: bool,
    /// Grant mediation requests as they arrive.
    pub auto_accept: bool,
    /// Routing keys handed out in grants.
    pub routing_keys: Vec<String>,
}

impl Default for MediatorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_accept: true,
            routing_keys: Vec::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default env-filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// Load agent configuration from a TOML file, falling back to defaults
/// when the file is missing or malformed.
pub fn load_config(path: Option<&Path>) -> AgentConfig {
    let Some(path) = path else {
        return AgentConfig::default();
    };
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return AgentConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<AgentConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to parse config, using defaults");
                AgentConfig::default()
            }
        },
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to read config file, using defaults");
            AgentConfig::default()
        }
    }
}
