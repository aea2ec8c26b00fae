//! Credential rotation with cooldown and per-kind rate limiting.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::cooldown::CooldownTracker;
use super::diagnostics::{KeyDiagnostics, KeySkipReason};
use super::rate_limiter::{RateLimitConfig, RateLimitPolicy, RateLimiter};
use crate::errors::{RetryClass, UpstreamError};
use crate::models::{Credential, CredentialKind};

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    60
}

/// How the rotator orders, paces and benches credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Put the unauthenticated tier first when no fine-grained interval is
    /// requested.
    #[serde(default)]
    pub try_anonymous_first: bool,
    /// Include the unauthenticated tier at all.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub policy: RateLimitPolicy,
    /// How long a failed credential stays out of rotation.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Overrides for the per-kind defaults.
    #[serde(default)]
    pub rate_limits: HashMap<CredentialKind, RateLimitConfig>,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            try_anonymous_first: false,
            allow_anonymous: true,
            policy: RateLimitPolicy::default(),
            cooldown_secs: default_cooldown_secs(),
            rate_limits: HashMap::new(),
        }
    }
}

/// Hands out credentials in priority order and tracks their health.
///
/// Shared by every chunk of every refresh of one fetcher, so all state sits
/// behind interior locks and the rotator is used through `&self`.
pub struct KeyRotator {
    credentials: Vec<Credential>,
    config: RotatorConfig,
    rate_limiter: RateLimiter,
    cooldown: CooldownTracker,
}

impl KeyRotator {
    /// Anonymous entries in `credentials` are ignored; the unauthenticated
    /// tier is controlled by [`RotatorConfig::allow_anonymous`].
    pub fn new(credentials: Vec<Credential>, config: RotatorConfig) -> Self {
        let mut credentials: Vec<Credential> = credentials
            .into_iter()
            .filter(|c| !c.is_anonymous() && !c.secret.is_empty())
            .collect();
        // Stable sort keeps configured order within a kind.
        credentials.sort_by_key(|c| c.kind);

        let rate_limiter = RateLimiter::new(config.rate_limits.clone());
        let cooldown = CooldownTracker::new(Duration::from_secs(config.cooldown_secs));

        Self {
            credentials,
            config,
            rate_limiter,
            cooldown,
        }
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Credentials usable right now, in the order they should be tried.
    ///
    /// Paid, then demo, then anonymous, unless `try_anonymous_first` is set and
    /// the request does not ask for a fine-grained interval. Credentials in
    /// cooldown are left out.
    pub fn available_keys(&self, fine_grained_interval: bool) -> Vec<Credential> {
        let mut ordered = self.credentials.clone();

        if self.config.allow_anonymous {
            let anonymous = Credential::anonymous();
            if self.config.try_anonymous_first && !fine_grained_interval {
                ordered.insert(0, anonymous);
            } else {
                ordered.push(anonymous);
            }
        }

        ordered
            .into_iter()
            .filter(|c| self.cooldown.is_available(&c.secret))
            .collect()
    }

    /// Put a credential into cooldown.
    pub fn mark_failed(&self, secret: &str) {
        self.cooldown.record_failure(secret);
    }

    /// Clear any cooldown on a credential.
    pub fn mark_succeeded(&self, secret: &str) {
        self.cooldown.record_success(secret);
    }

    pub fn cooldown_remaining(&self, secret: &str) -> Option<Duration> {
        self.cooldown.cooldown_remaining(secret)
    }

    /// Run `work` with each credential in `keys` until one succeeds.
    ///
    /// Every credential whose call fails is marked failed before moving on.
    /// Errors classified [`RetryClass::Never`] (cancellation, bad templates)
    /// stop the loop at once without blaming the credential. When every
    /// credential fails the last error comes back as
    /// [`UpstreamError::CredentialsExhausted`].
    pub async fn try_with_keys<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        keys: &[Credential],
        mut work: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if keys.is_empty() {
            return Err(UpstreamError::NoCredentialsAvailable(
                "all credentials are cooling down or none are configured".to_string(),
            ));
        }

        let mut diagnostics = KeyDiagnostics::new();
        let mut last_error: Option<UpstreamError> = None;

        for key in keys {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }

            match self.config.policy {
                RateLimitPolicy::Wait => self.rate_limiter.acquire(key.kind, cancel).await?,
                RateLimitPolicy::Skip => {
                    if !self.rate_limiter.try_acquire(key.kind) {
                        debug!("Skipping {}: local rate limit reached", key);
                        diagnostics.record_skip(key.masked(), KeySkipReason::RateLimited);
                        continue;
                    }
                }
            }

            match work(key.clone()).await {
                Ok(value) => {
                    self.mark_succeeded(&key.secret);
                    diagnostics.record_success(key.masked());
                    if diagnostics.attempts.len() > 1 {
                        info!("Credential rotation: {}", diagnostics.summary());
                    }
                    return Ok(value);
                }
                Err(e) if e.retry_class() == RetryClass::Never => {
                    debug!("Aborting credential rotation at {}: {}", key, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Request with {} failed: {}", key, e);
                    self.mark_failed(&key.secret);
                    diagnostics.record_error(key.masked(), e.to_string());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(source) => {
                warn!("All credentials failed: {}", diagnostics.summary());
                Err(UpstreamError::CredentialsExhausted {
                    tried: diagnostics.tried(),
                    source: Box::new(source),
                })
            }
            None => Err(UpstreamError::NoCredentialsAvailable(format!(
                "every credential was skipped: {}",
                diagnostics.summary()
            ))),
        }
    }
}
