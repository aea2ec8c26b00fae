//! Engine error types.

use pricecache_upstream::UpstreamError;
use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the fetch-and-cache engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rejected at construction time. Never raised once a fetcher runs.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// An identifier provider failed.
    #[error("Identifier provider failed: {0}")]
    Provider(String),

    #[error("Cache store error: {0}")]
    Cache(String),

    /// A non-empty identifier slice produced nothing, which points at a
    /// broken upstream rather than legitimately empty data.
    #[error("Tier '{tier}' (ids {from}-{to}) fetched no data for {requested} requested ids")]
    ZeroYield {
        tier: String,
        from: usize,
        to: usize,
        requested: usize,
    },

    #[error("Tier '{tier}' (ids {from}-{to}) refresh failed: {source}")]
    TierFailed {
        tier: String,
        from: usize,
        to: usize,
        #[source]
        source: Box<EngineError>,
    },

    /// One or more tiers failed during a forced refresh.
    #[error("Refresh failed for {}", .0.join(", "))]
    RefreshFailed(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// True if this error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_cancelled(),
            Self::TierFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
