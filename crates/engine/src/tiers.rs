//! Refresh tiers and their runtime state.
//!
//! A tier is a contiguous, 1-based, inclusive slice of the ranked identifier
//! list with its own refresh interval. Tiers of one fetcher never overlap.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::{EngineError, Result};

/// Lower bound for the stuck-refresh timeout.
pub const MIN_STUCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Tier as it appears in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub id_from: usize,
    pub id_to: usize,
    pub update_interval_secs: u64,
    #[serde(default)]
    pub fetch_supplementary_ids: bool,
}

/// A validated refresh tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    pub id_from: usize,
    pub id_to: usize,
    pub update_interval: Duration,
    pub fetch_supplementary_ids: bool,
}

impl From<&TierConfig> for Tier {
    fn from(config: &TierConfig) -> Self {
        Self {
            name: config.name.clone(),
            id_from: config.id_from,
            id_to: config.id_to,
            update_interval: Duration::from_secs(config.update_interval_secs),
            fetch_supplementary_ids: config.fetch_supplementary_ids,
        }
    }
}

impl Tier {
    /// This tier's identifiers from `ranked`, clamped to its length.
    ///
    /// Empty when the tier starts beyond the end of the list.
    pub fn slice<'a>(&self, ranked: &'a [String]) -> &'a [String] {
        let start = self.id_from.saturating_sub(1);
        if start >= ranked.len() {
            return &[];
        }
        let end = self.id_to.min(ranked.len());
        &ranked[start..end]
    }

    /// How long a refresh may run before the watchdog releases the tier.
    pub fn stuck_timeout(&self) -> Duration {
        MIN_STUCK_TIMEOUT.max(self.update_interval.saturating_mul(3))
    }

    pub fn range_label(&self) -> String {
        format!("{}-{}", self.id_from, self.id_to)
    }
}

/// Reject tiers with bad ranges, non-positive intervals, duplicate names or
/// overlaps.
pub fn validate_tiers(tiers: &[Tier]) -> Result<()> {
    let mut names = HashSet::new();

    for tier in tiers {
        if tier.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "tier name must not be empty".to_string(),
            ));
        }
        if !names.insert(tier.name.as_str()) {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate tier name '{}'",
                tier.name
            )));
        }
        if tier.id_from == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "tier '{}': id_from must be at least 1",
                tier.name
            )));
        }
        if tier.id_to < tier.id_from {
            return Err(EngineError::InvalidConfig(format!(
                "tier '{}': id_to ({}) is before id_from ({})",
                tier.name, tier.id_to, tier.id_from
            )));
        }
        if tier.update_interval.is_zero() {
            return Err(EngineError::InvalidConfig(format!(
                "tier '{}': update interval must be positive",
                tier.name
            )));
        }
    }

    let mut sorted: Vec<&Tier> = tiers.iter().collect();
    sorted.sort_by_key(|t| t.id_from);
    for pair in sorted.windows(2) {
        if pair[1].id_from <= pair[0].id_to {
            return Err(EngineError::InvalidConfig(format!(
                "tiers '{}' ({}) and '{}' ({}) overlap",
                pair[0].name,
                pair[0].range_label(),
                pair[1].name,
                pair[1].range_label()
            )));
        }
    }

    Ok(())
}

/// Mutable scheduling state of one tier. Owned by the updater.
#[derive(Clone, Debug, Default)]
pub(crate) struct TierState {
    pub last_update: Option<Instant>,
    pub update_start_time: Option<Instant>,
    pub is_updating: bool,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub update_started_at: Option<DateTime<Utc>>,
}

impl TierState {
    /// Idle and at least one interval since the last successful refresh.
    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        if self.is_updating {
            return false;
        }
        match self.last_update {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        }
    }

    pub fn is_stuck(&self, now: Instant, timeout: Duration) -> bool {
        match (self.is_updating, self.update_start_time) {
            (true, Some(started)) => now.saturating_duration_since(started) > timeout,
            _ => false,
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.is_updating = true;
        self.update_start_time = Some(now);
        self.update_started_at = Some(Utc::now());
    }

    /// Release the watchdog-stuck tier without touching `last_update`.
    pub fn release(&mut self) {
        self.is_updating = false;
        self.update_start_time = None;
        self.update_started_at = None;
    }

    /// Record the end of the refresh that began at `started`.
    ///
    /// Only the refresh that currently owns the tier clears the updating
    /// flag. A success from any run advances `last_update`.
    pub fn finish(&mut self, started: Instant, succeeded: bool, now: Instant) {
        if self.update_start_time == Some(started) {
            self.release();
        }
        if succeeded {
            self.last_update = Some(self.last_update.map_or(now, |last| last.max(now)));
            self.last_updated_at = Some(Utc::now());
        }
    }

    pub fn status(&self, tier: &Tier) -> TierStatus {
        TierStatus {
            name: tier.name.clone(),
            id_from: tier.id_from,
            id_to: tier.id_to,
            update_interval_secs: tier.update_interval.as_secs(),
            is_updating: self.is_updating,
            last_updated_at: self.last_updated_at,
            update_started_at: self.update_started_at,
        }
    }
}

/// Read-only snapshot of a tier for health and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStatus {
    pub name: String,
    pub id_from: usize,
    pub id_to: usize,
    pub update_interval_secs: u64,
    pub is_updating: bool,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub update_started_at: Option<DateTime<Utc>>,
}
