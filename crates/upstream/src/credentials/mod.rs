//! API credentials: loading, ordering, pacing and failure cooldown.

mod cooldown;
mod diagnostics;
mod rate_limiter;
mod rotator;

pub use cooldown::{CooldownTracker, DEFAULT_COOLDOWN};
pub use diagnostics::{KeyAttempt, KeyDiagnostics, KeySkipReason};
pub use rate_limiter::{RateLimitConfig, RateLimitPolicy, RateLimiter};
pub use rotator::{KeyRotator, RotatorConfig};

use std::env;

use log::debug;

use crate::models::Credential;

/// Environment variable holding comma separated paid keys.
pub const PAID_KEYS_ENV: &str = "PRICECACHE_PAID_API_KEYS";
/// Environment variable holding comma separated demo keys.
pub const DEMO_KEYS_ENV: &str = "PRICECACHE_DEMO_API_KEYS";

/// The static list of configured credentials.
#[derive(Clone, Debug, Default)]
pub struct CredentialSet {
    pub credentials: Vec<Credential>,
}

impl CredentialSet {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Load keys from the environment, reading a `.env` file first if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut credentials = Vec::new();
        credentials.extend(split_keys(env::var(PAID_KEYS_ENV).ok()).map(Credential::paid));
        credentials.extend(split_keys(env::var(DEMO_KEYS_ENV).ok()).map(Credential::demo));

        debug!("Loaded {} credential(s) from environment", credentials.len());
        Self { credentials }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn into_rotator(self, config: RotatorConfig) -> KeyRotator {
        KeyRotator::new(self.credentials, config)
    }
}

fn split_keys(raw: Option<String>) -> impl Iterator<Item = String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect::<Vec<_>>()
        .into_iter()
}
