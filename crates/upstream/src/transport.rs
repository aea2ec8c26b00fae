//! HTTP transport with bounded retries and jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{is_retryable_status, UpstreamError};

/// Longest error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 256;

/// Backoff exponent cap, keeps `base * 2^k` from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Retry budget and timeouts for one transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero is treated as one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RetryConfig {
    /// Read overrides from `PRICECACHE_*` variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        }

        Self {
            max_retries: var_or("PRICECACHE_MAX_RETRIES", defaults.max_retries),
            base_backoff_ms: var_or("PRICECACHE_BASE_BACKOFF_MS", defaults.base_backoff_ms),
            connection_timeout_ms: var_or(
                "PRICECACHE_CONNECT_TIMEOUT_MS",
                defaults.connection_timeout_ms,
            ),
            request_timeout_ms: var_or(
                "PRICECACHE_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Delay before attempt `attempt` (zero-based). Attempt 0 never waits.
///
/// `base * 2^(attempt - 1)` plus uniform jitter in `[0, half of that]`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
    let backoff = base.saturating_mul(1u32 << exponent);
    let half_ms = u64::try_from(backoff.as_millis() / 2).unwrap_or(u64::MAX);
    let jitter = if half_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half_ms)
    };
    backoff.saturating_add(Duration::from_millis(jitter))
}

/// A GET request against the upstream.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub url: String,
    /// Short description for logs and status callbacks. Never contains secrets.
    pub label: String,
}

impl UpstreamRequest {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

/// A successful response.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub body: Bytes,
    pub elapsed: Duration,
    /// Attempts it took, the successful one included.
    pub attempts: u32,
}

/// Outcome of one attempt, as reported to a [`StatusHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    Error,
    /// A further attempt is about to be made.
    Retry,
}

#[derive(Clone, Debug)]
pub struct StatusEvent {
    pub label: String,
    pub outcome: AttemptOutcome,
    /// Zero-based attempt index.
    pub attempt: u32,
    pub status: Option<u16>,
}

/// Receives a callback for every attempt outcome and every retry.
pub trait StatusHandler: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

/// Retrying HTTP GET transport.
pub struct RetryTransport {
    client: Client,
    config: RetryConfig,
    status_handler: Option<Arc<dyn StatusHandler>>,
}

impl RetryTransport {
    pub fn new(config: RetryConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connection_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| UpstreamError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            status_handler: None,
        })
    }

    pub fn with_status_handler(mut self, handler: Arc<dyn StatusHandler>) -> Self {
        self.status_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn notify(
        &self,
        request: &UpstreamRequest,
        outcome: AttemptOutcome,
        attempt: u32,
        status: Option<u16>,
    ) {
        if let Some(handler) = &self.status_handler {
            handler.on_status(&StatusEvent {
                label: request.label.clone(),
                outcome,
                attempt,
                status,
            });
        }
    }

    /// Execute `request`, retrying transient failures.
    ///
    /// Connection errors, timeouts and statuses 429/500/502/503/504 are
    /// retried up to the configured attempt count. Any other non-2xx status
    /// or an unreadable body is returned immediately.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &UpstreamRequest,
    ) -> Result<TransportResponse, UpstreamError> {
        let started = Instant::now();
        let attempts = self.config.attempts();
        let base = Duration::from_millis(self.config.base_backoff_ms);
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.notify(request, AttemptOutcome::Retry, attempt, None);
                let delay = backoff_delay(base, attempt);
                debug!(
                    "Retrying {} (attempt {}/{}) in {:?}",
                    request.label,
                    attempt + 1,
                    attempts,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                result = self.client.get(&request.url).send() => result,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let error = UpstreamError::from_reqwest(&e);
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        request.label,
                        attempt + 1,
                        attempts,
                        error
                    );
                    self.notify(request, AttemptOutcome::Error, attempt, None);
                    last_error = Some(error);
                    continue;
                }
            };

            let status = response.status();
            let code = status.as_u16();

            if status.is_success() {
                let body = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                    body = response.bytes() => body,
                };
                return match body {
                    Ok(body) => {
                        self.notify(request, AttemptOutcome::Success, attempt, Some(code));
                        Ok(TransportResponse {
                            body,
                            elapsed: started.elapsed(),
                            attempts: attempt + 1,
                        })
                    }
                    Err(e) => {
                        self.notify(request, AttemptOutcome::Error, attempt, Some(code));
                        Err(UpstreamError::BodyRead(e.to_string()))
                    }
                };
            }

            if code == 429 {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                warn!(
                    "{} rate limited by upstream (attempt {}/{}, Retry-After: {})",
                    request.label,
                    attempt + 1,
                    attempts,
                    retry_after
                );
                self.notify(request, AttemptOutcome::RateLimited, attempt, Some(code));
            } else {
                self.notify(request, AttemptOutcome::Error, attempt, Some(code));
            }

            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            let error = UpstreamError::Status {
                status: code,
                body: truncate(&body, MAX_ERROR_BODY),
            };

            if !is_retryable_status(code) {
                debug!("{} failed with terminal status {}", request.label, code);
                return Err(error);
            }

            if code != 429 {
                warn!(
                    "{} attempt {}/{} failed: {}",
                    request.label,
                    attempt + 1,
                    attempts,
                    error
                );
            }
            last_error = Some(error);
        }

        let source = last_error.unwrap_or_else(|| UpstreamError::Transport {
            message: "no attempt was made".to_string(),
            timeout: false,
        });
        Err(UpstreamError::RetriesExhausted {
            attempts,
            source: Box::new(source),
        })
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
