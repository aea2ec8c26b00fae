//! Tiered fetch-and-cache engine.
//!
//! A [`MarketDataFetcher`] keeps one upstream dataset warm in a cache. Its
//! ranked identifier list is split into [`Tier`]s, each refreshed on its own
//! interval by the [`TieredUpdater`]; fetched chunks are written to the cache
//! as they arrive and announced on the [`EventBus`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pricecache_engine::{
//!     FetcherConfig, MarketDataFetcher, MemoryCacheStore, StaticIdProvider, TierConfig,
//! };
//! use pricecache_upstream::{CredentialSet, EndpointConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> pricecache_engine::Result<()> {
//! let config = FetcherConfig::new(
//!     "simple-price",
//!     EndpointConfig::new("/simple/price?ids={{ids_list}}").with_query_param("vs_currencies", "usd"),
//! )
//! .with_tier(TierConfig {
//!     name: "top".to_string(),
//!     id_from: 1,
//!     id_to: 100,
//!     update_interval_secs: 30,
//!     fetch_supplementary_ids: false,
//! });
//!
//! let fetcher = MarketDataFetcher::from_upstream(
//!     config,
//!     CredentialSet::from_env(),
//!     Arc::new(MemoryCacheStore::new()),
//!     Arc::new(StaticIdProvider::new(["bitcoin", "ethereum"])),
//! )?;
//!
//! let shutdown = CancellationToken::new();
//! let scheduler = fetcher.start(shutdown.clone());
//! // ...
//! shutdown.cancel();
//! let _ = scheduler.await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod service;
pub mod tiers;
pub mod updater;

pub use cache::{
    cache_key, CacheLookup, CachePublisher, CacheStatus, CacheStore, Lookup, MemoryCacheStore,
};
pub use config::FetcherConfig;
pub use errors::{EngineError, Result};
pub use events::{EventBus, RefreshEvent, Subscription};
pub use ids::{IdentifierProvider, StaticIdProvider};
pub use service::MarketDataFetcher;
pub use tiers::{validate_tiers, Tier, TierConfig, TierStatus};
pub use updater::{TieredUpdater, SIMPLE_TIER_NAME, TICK_INTERVAL};

pub use pricecache_upstream as upstream;
