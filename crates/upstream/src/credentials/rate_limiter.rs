//! Token bucket rate limiter per credential kind.
//!
//! Paid, demo and anonymous access each get their own bucket with a
//! requests-per-minute refill rate and a burst capacity. The limiter gates
//! how soon a credential kind may be used again, independent of whether its
//! keys are cooling down after failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::UpstreamError;
use crate::models::CredentialKind;

/// Token bucket for a single credential kind.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Last time the bucket was updated.
    last_update: Instant,
    /// Token refill rate (tokens per second).
    rate: f64,
    /// Maximum bucket capacity.
    capacity: f64,
}

impl TokenBucket {
    fn with_config(config: &RateLimitConfig) -> Self {
        let capacity = config.burst.max(1) as f64;
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: config.requests_per_minute.max(1) as f64 / 60.0,
            capacity,
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Requests-per-minute and burst for one credential kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl RateLimitConfig {
    pub const fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
        }
    }

    /// Published upstream allowance for each credential kind.
    pub fn default_for(kind: CredentialKind) -> Self {
        match kind {
            CredentialKind::Paid => Self::new(500, 50),
            CredentialKind::Demo => Self::new(30, 5),
            CredentialKind::Anonymous => Self::new(10, 2),
        }
    }
}

/// What to do when a credential kind is over its limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Sleep until a token is available.
    #[default]
    Wait,
    /// Move on to the next credential.
    Skip,
}

/// Token bucket rate limiter keyed by credential kind.
///
/// Buckets are created lazily from the configured limits, falling back to
/// [`RateLimitConfig::default_for`].
pub struct RateLimiter {
    buckets: Mutex<HashMap<CredentialKind, TokenBucket>>,
    configs: HashMap<CredentialKind, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(configs: HashMap<CredentialKind, RateLimitConfig>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            configs,
        }
    }

    /// Lock the buckets mutex, recovering from poison if necessary.
    ///
    /// The worst case of a poisoned bucket map is slightly wrong pacing,
    /// which is better than panicking the fetch path.
    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<CredentialKind, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter buckets mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn config_for(&self, kind: CredentialKind) -> RateLimitConfig {
        self.configs
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RateLimitConfig::default_for(kind))
    }

    /// Wait until a token for `kind` is available.
    ///
    /// Returns [`UpstreamError::Cancelled`] if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        kind: CredentialKind,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        loop {
            let wait_time = {
                let mut buckets = self.lock_buckets();
                let bucket = buckets
                    .entry(kind)
                    .or_insert_with(|| TokenBucket::with_config(&self.config_for(kind)));

                if bucket.try_acquire() {
                    return Ok(());
                }
                bucket.time_until_available()
            };

            debug!("Rate limiter: waiting {:?} for {} credentials", wait_time, kind);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(wait_time.max(Duration::from_millis(1))) => {}
            }
        }
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self, kind: CredentialKind) -> bool {
        let mut buckets = self.lock_buckets();
        buckets
            .entry(kind)
            .or_insert_with(|| TokenBucket::with_config(&self.config_for(kind)))
            .try_acquire()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
