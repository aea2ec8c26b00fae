//! Per-credential failure cooldown.
//!
//! A credential that fails is benched for a fixed window. While benched it
//! is left out of the rotator's available keys, which bounds how hard a
//! single bad key can be hammered. State is in-memory only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

/// Default time a failed credential stays out of rotation.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct FailureRecord {
    last_failure: Instant,
    failure_count: u32,
}

/// Tracks failed credentials by secret.
pub struct CooldownTracker {
    failures: Mutex<HashMap<String, FailureRecord>>,
    cooldown: Duration,
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<String, FailureRecord>> {
        self.failures.lock().unwrap_or_else(|poisoned| {
            warn!("Cooldown tracker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Whether `secret` may be used right now.
    ///
    /// Expired records are dropped on read.
    pub fn is_available(&self, secret: &str) -> bool {
        let mut failures = self.lock_failures();
        match failures.get(secret) {
            None => true,
            Some(record) if record.last_failure.elapsed() >= self.cooldown => {
                debug!(
                    "Credential cooldown elapsed after {} failure(s)",
                    record.failure_count
                );
                failures.remove(secret);
                true
            }
            Some(_) => false,
        }
    }

    /// Bench `secret` for one cooldown window, starting now.
    pub fn record_failure(&self, secret: &str) {
        let mut failures = self.lock_failures();
        let record = failures
            .entry(secret.to_string())
            .or_insert_with(|| FailureRecord {
                last_failure: Instant::now(),
                failure_count: 0,
            });
        record.last_failure = Instant::now();
        record.failure_count += 1;

        if record.failure_count > 1 {
            info!(
                "Credential failed again ({} consecutive), cooling down for {:?}",
                record.failure_count, self.cooldown
            );
        }
    }

    /// Clear any failure state for `secret`.
    pub fn record_success(&self, secret: &str) {
        self.lock_failures().remove(secret);
    }

    /// Time left before `secret` is usable again, if it is benched.
    pub fn cooldown_remaining(&self, secret: &str) -> Option<Duration> {
        let failures = self.lock_failures();
        let record = failures.get(secret)?;
        let elapsed = record.last_failure.elapsed();
        if elapsed >= self.cooldown {
            None
        } else {
            Some(self.cooldown - elapsed)
        }
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
