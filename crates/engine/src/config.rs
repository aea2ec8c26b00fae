//! Fetcher configuration.

use std::time::Duration;

use pricecache_upstream::{ChunkConfig, EndpointConfig, RequestBuilder, RetryConfig, RotatorConfig};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::tiers::{validate_tiers, Tier, TierConfig};

fn default_ttl_secs() -> u64 {
    300
}

fn default_update_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Everything one fetcher needs.
///
/// Without `tiers` the fetcher refreshes the whole ranked list every
/// `update_interval_secs`; with tiers each tier runs on its own interval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Also the cache namespace.
    pub name: String,
    pub endpoint: EndpointConfig,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(flatten)]
    pub chunk: ChunkConfig,
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    /// Fetch single-id misses from the upstream in `get_by_id`.
    #[serde(default = "default_true")]
    pub read_through: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rotator: RotatorConfig,
}

impl FetcherConfig {
    pub fn new(name: impl Into<String>, endpoint: EndpointConfig) -> Self {
        Self {
            name: name.into(),
            endpoint,
            ttl_secs: default_ttl_secs(),
            chunk: ChunkConfig::default(),
            update_interval_secs: default_update_interval_secs(),
            tiers: Vec::new(),
            read_through: true,
            retry: RetryConfig::default(),
            rotator: RotatorConfig::default(),
        }
    }

    pub fn with_tier(mut self, tier: TierConfig) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn is_tiered(&self) -> bool {
        !self.tiers.is_empty()
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.tiers.iter().map(Tier::from).collect()
    }

    /// Reject anything that would only fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "fetcher name must not be empty".to_string(),
            ));
        }

        RequestBuilder::new(&self.endpoint).map_err(|e| {
            EngineError::InvalidConfig(format!("fetcher '{}': {}", self.name, e))
        })?;

        if self.chunk.chunk_size == 0 {
            return Err(self.invalid("chunk_size must be positive"));
        }
        if self.chunk.max_ids_len == 0 {
            return Err(self.invalid("max_ids_len must be positive"));
        }
        if self.ttl_secs == 0 {
            return Err(self.invalid("ttl_secs must be positive"));
        }
        if self.retry.connection_timeout_ms == 0 {
            return Err(self.invalid("retry.connection_timeout_ms must be positive"));
        }
        if self.retry.request_timeout_ms == 0 {
            return Err(self.invalid("retry.request_timeout_ms must be positive"));
        }

        if self.is_tiered() {
            validate_tiers(&self.tiers()).map_err(|e| match e {
                EngineError::InvalidConfig(message) => self.invalid(&message),
                other => other,
            })?;
        } else if self.update_interval_secs == 0 {
            return Err(self.invalid("update_interval_secs must be positive"));
        }

        Ok(())
    }

    fn invalid(&self, message: &str) -> EngineError {
        EngineError::InvalidConfig(format!("fetcher '{}': {}", self.name, message))
    }
}
