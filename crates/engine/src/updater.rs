//! Tiered periodic updater.
//!
//! A single ticker checks every tier each [`TICK_INTERVAL`]. A tier that is
//! idle and due gets its own refresh task, so a slow tier never delays the
//! others. Within one refresh, chunks run sequentially through the
//! [`ChunkedFetcher`].
//!
//! Per tier the state goes Idle -> Updating -> Idle. A refresh stuck in
//! Updating for longer than [`Tier::stuck_timeout`] is released by the
//! watchdog on the next tick; the hung task itself keeps running.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use pricecache_upstream::{ChunkSink, ChunkedFetcher, Payloads};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::CachePublisher;
use crate::config::FetcherConfig;
use crate::errors::{EngineError, Result};
use crate::events::{EventBus, RefreshEvent};
use crate::ids::{IdentifierProvider, ProviderSlot};
use crate::tiers::{Tier, TierState, TierStatus};

/// How often tiers are checked.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Name of the implicit tier of a non-tiered fetcher.
pub const SIMPLE_TIER_NAME: &str = "all";

/// Caches every chunk as it arrives and tells subscribers about it.
struct PublishingSink<'a> {
    publisher: &'a CachePublisher,
    events: &'a EventBus,
    fetcher: &'a str,
    tier: &'a str,
}

#[async_trait]
impl<'a> ChunkSink for PublishingSink<'a> {
    async fn on_chunk(&self, chunk: &Payloads) {
        if chunk.is_empty() {
            return;
        }
        if let Err(e) = self.publisher.store(chunk).await {
            warn!(
                "[{}] Failed to cache chunk of {} item(s) for tier '{}': {}",
                self.fetcher,
                chunk.len(),
                self.tier,
                e
            );
            return;
        }
        self.events.publish(RefreshEvent::ChunkStored {
            fetcher: self.fetcher.to_string(),
            tier: self.tier.to_string(),
            items: chunk.len(),
        });
    }
}

/// Schedules and runs refreshes for one fetcher.
pub struct TieredUpdater {
    name: String,
    simple: bool,
    tiers: Vec<Tier>,
    states: RwLock<HashMap<String, TierState>>,
    initialized: AtomicBool,
    fetcher: ChunkedFetcher,
    publisher: CachePublisher,
    ids: ProviderSlot,
    supplementary: ProviderSlot,
    events: EventBus,
}

impl TieredUpdater {
    /// `config` is expected to be validated already.
    pub fn new(
        config: &FetcherConfig,
        fetcher: ChunkedFetcher,
        publisher: CachePublisher,
        ids: Arc<dyn IdentifierProvider>,
        events: EventBus,
    ) -> Self {
        let simple = !config.is_tiered();
        let tiers = if simple {
            vec![Tier {
                name: SIMPLE_TIER_NAME.to_string(),
                id_from: 1,
                id_to: usize::MAX,
                update_interval: config.update_interval(),
                fetch_supplementary_ids: false,
            }]
        } else {
            config.tiers()
        };

        let states = tiers
            .iter()
            .map(|tier| (tier.name.clone(), TierState::default()))
            .collect();

        Self {
            name: config.name.clone(),
            simple,
            tiers,
            states: RwLock::new(states),
            initialized: AtomicBool::new(false),
            fetcher,
            publisher,
            ids: ProviderSlot::new(Some(ids)),
            supplementary: ProviderSlot::default(),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// True once any refresh has completed with data. Never reset.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_id_provider(&self, provider: Arc<dyn IdentifierProvider>) {
        self.ids.replace(Some(provider));
    }

    pub fn set_supplementary_provider(&self, provider: Option<Arc<dyn IdentifierProvider>>) {
        self.supplementary.replace(provider);
    }

    fn read_states(&self) -> RwLockReadGuard<'_, HashMap<String, TierState>> {
        self.states.read().unwrap_or_else(|poisoned| {
            warn!("[{}] Tier state lock was poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    fn write_states(&self) -> RwLockWriteGuard<'_, HashMap<String, TierState>> {
        self.states.write().unwrap_or_else(|poisoned| {
            warn!("[{}] Tier state lock was poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    /// Snapshot of every tier, in configuration order.
    pub fn tier_statuses(&self) -> Vec<TierStatus> {
        let states = self.read_states();
        self.tiers
            .iter()
            .map(|tier| {
                states
                    .get(&tier.name)
                    .cloned()
                    .unwrap_or_default()
                    .status(tier)
            })
            .collect()
    }

    /// Tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "[{}] Updater started with {} tier(s)",
            self.name,
            self.tiers.len()
        );
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_tiers(&cancel);
                }
            }
        }
        info!("[{}] Updater stopped", self.name);
    }

    /// Release tiers whose refresh has been running too long. Returns their
    /// names.
    pub fn run_watchdog(&self, now: Instant) -> Vec<String> {
        let mut released = Vec::new();
        let mut states = self.write_states();
        for tier in &self.tiers {
            if let Some(state) = states.get_mut(&tier.name) {
                if state.is_stuck(now, tier.stuck_timeout()) {
                    warn!(
                        "[{}] Tier '{}' (ids {}) stuck updating for over {:?}, resetting",
                        self.name,
                        tier.name,
                        tier.range_label(),
                        tier.stuck_timeout()
                    );
                    state.release();
                    released.push(tier.name.clone());
                }
            }
        }
        released
    }

    /// One scheduler pass: run the watchdog, then spawn a refresh for every
    /// idle tier whose interval has elapsed. Returns the launched tier names.
    pub fn check_tiers(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<String> {
        let now = Instant::now();
        self.run_watchdog(now);

        let due: Vec<Tier> = {
            let mut states = self.write_states();
            self.tiers
                .iter()
                .filter(|tier| {
                    let state = states.entry(tier.name.clone()).or_default();
                    if state.is_due(now, tier.update_interval) {
                        state.begin(now);
                        true
                    } else {
                        false
                    }
                })
                .cloned()
                .collect()
        };

        let launched: Vec<String> = due.iter().map(|tier| tier.name.clone()).collect();
        for tier in due {
            let updater = Arc::clone(self);
            let token = cancel.child_token();
            tokio::spawn(async move {
                // Failures are logged inside; the next due tick retries.
                let _ = updater.run_refresh(&tier, now, &token).await;
            });
        }
        launched
    }

    /// Refresh every idle tier now, regardless of interval, and wait for
    /// all of them. Busy tiers are skipped.
    pub async fn force_update(&self, cancel: &CancellationToken) -> Result<()> {
        let now = Instant::now();
        self.run_watchdog(now);

        let claimed: Vec<Tier> = {
            let mut states = self.write_states();
            self.tiers
                .iter()
                .filter(|tier| {
                    let state = states.entry(tier.name.clone()).or_default();
                    if state.is_updating {
                        info!(
                            "[{}] Tier '{}' is already updating, skipping forced refresh",
                            self.name, tier.name
                        );
                        false
                    } else {
                        state.begin(now);
                        true
                    }
                })
                .cloned()
                .collect()
        };

        let results = join_all(
            claimed
                .iter()
                .map(|tier| self.run_refresh(tier, now, cancel)),
        )
        .await;

        let failed: Vec<String> = claimed
            .iter()
            .zip(results)
            .filter(|(_, result)| result.is_err())
            .map(|(tier, _)| tier.name.clone())
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::RefreshFailed(failed))
        }
    }

    /// Run one refresh that was claimed at `started` and record its outcome.
    async fn run_refresh(
        &self,
        tier: &Tier,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let result = self.refresh_tier(tier, cancel).await;

        if let Some(state) = self.write_states().get_mut(&tier.name) {
            state.finish(started, result.is_ok(), Instant::now());
        }

        match result {
            Ok(items) => {
                debug!(
                    "[{}] Tier '{}' refreshed {} item(s) in {:?}",
                    self.name,
                    tier.name,
                    items,
                    started.elapsed()
                );
                Ok(items)
            }
            Err(e) if e.is_cancelled() => {
                info!("[{}] Tier '{}' refresh cancelled", self.name, tier.name);
                Err(e)
            }
            Err(e @ EngineError::ZeroYield { .. }) => {
                error!("[{}] {}", self.name, e);
                Err(e)
            }
            Err(e) => {
                let e = EngineError::TierFailed {
                    tier: tier.name.clone(),
                    from: tier.id_from,
                    to: tier.id_to,
                    source: Box::new(e),
                };
                error!("[{}] {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Fetch and publish one tier. Returns the number of items fetched.
    async fn refresh_tier(&self, tier: &Tier, cancel: &CancellationToken) -> Result<usize> {
        let provider = self.ids.current().ok_or_else(|| {
            EngineError::Provider("no identifier provider installed".to_string())
        })?;

        let limit = if self.simple { 0 } else { tier.id_to };
        let ranked = provider.get_ids(limit).await?;
        let slice = tier.slice(&ranked);

        if slice.is_empty() {
            debug!(
                "[{}] Tier '{}' starts beyond the {} ranked id(s), nothing to fetch",
                self.name,
                tier.name,
                ranked.len()
            );
            return Ok(0);
        }

        let sink = PublishingSink {
            publisher: &self.publisher,
            events: &self.events,
            fetcher: &self.name,
            tier: &tier.name,
        };

        let mut data = self.fetcher.fetch_data(cancel, slice, &sink).await?;

        if tier.fetch_supplementary_ids {
            match self.fetch_supplementary(&data, cancel, &sink).await {
                Ok(extra) => data.extend(extra),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(
                    "[{}] Supplementary ids for tier '{}' failed: {}",
                    self.name, tier.name, e
                ),
            }
        }

        if data.is_empty() {
            return Err(EngineError::ZeroYield {
                tier: tier.name.clone(),
                from: tier.id_from,
                to: tier.id_to.min(ranked.len()),
                requested: slice.len(),
            });
        }

        self.initialized.store(true, Ordering::Release);

        let event = if self.simple {
            RefreshEvent::RefreshCompleted {
                fetcher: self.name.clone(),
                items: data.len(),
            }
        } else {
            RefreshEvent::TierCompleted {
                fetcher: self.name.clone(),
                tier: tier.name.clone(),
                items: data.len(),
            }
        };
        self.events.publish(event);

        Ok(data.len())
    }

    /// Fetch ids from the secondary source that the tier result lacks.
    async fn fetch_supplementary(
        &self,
        fetched: &Payloads,
        cancel: &CancellationToken,
        sink: &PublishingSink<'_>,
    ) -> Result<Payloads> {
        let Some(provider) = self.supplementary.current() else {
            debug!("[{}] No supplementary id provider installed", self.name);
            return Ok(Payloads::new());
        };

        let mut seen = HashSet::new();
        let extra: Vec<String> = provider
            .get_ids(0)
            .await?
            .into_iter()
            .filter(|id| !fetched.contains_key(id) && seen.insert(id.clone()))
            .collect();

        if extra.is_empty() {
            return Ok(Payloads::new());
        }

        debug!(
            "[{}] Fetching {} supplementary id(s)",
            self.name,
            extra.len()
        );
        Ok(self.fetcher.fetch_data(cancel, &extra, sink).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStatus, MemoryCacheStore};
    use crate::ids::StaticIdProvider;
    use crate::tiers::TierConfig;
    use bytes::Bytes;
    use pricecache_upstream::{BatchClient, ChunkConfig, EndpointConfig, FetchMode, UpstreamError};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Echoes requested ids, optionally leaving some out or failing.
    struct MockClient {
        calls: AtomicUsize,
        requested: Mutex<Vec<String>>,
        omit: HashSet<String>,
        fail: AtomicBool,
        fail_on_call: Option<usize>,
    }

    impl MockClient {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
                omit: HashSet::new(),
                fail: AtomicBool::new(false),
                fail_on_call: None,
            }
        }

        fn omitting(ids: &[&str]) -> Self {
            Self {
                omit: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl BatchClient for MockClient {
        fn mode(&self) -> FetchMode {
            FetchMode::Batch
        }

        async fn fetch_chunk(
            &self,
            _cancel: &CancellationToken,
            ids: &[String],
        ) -> std::result::Result<Payloads, UpstreamError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requested.lock().unwrap().extend(ids.iter().cloned());
            if self.fail.load(Ordering::SeqCst) || self.fail_on_call == Some(call) {
                return Err(UpstreamError::Status {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(ids
                .iter()
                .filter(|id| !self.omit.contains(*id))
                .map(|id| (id.clone(), Bytes::from(format!("{{\"id\":\"{}\"}}", id))))
                .collect())
        }
    }

    /// Identifier provider that always fails.
    struct FailingProvider;

    #[async_trait]
    impl IdentifierProvider for FailingProvider {
        async fn get_ids(&self, _limit: usize) -> Result<Vec<String>> {
            Err(EngineError::Provider("ranking service down".to_string()))
        }
    }

    fn tier(name: &str, from: usize, to: usize, secs: u64, supplementary: bool) -> TierConfig {
        TierConfig {
            name: name.to_string(),
            id_from: from,
            id_to: to,
            update_interval_secs: secs,
            fetch_supplementary_ids: supplementary,
        }
    }

    struct Harness {
        updater: Arc<TieredUpdater>,
        client: Arc<MockClient>,
        store: Arc<MemoryCacheStore>,
        publisher: CachePublisher,
        events: EventBus,
    }

    fn harness(config: FetcherConfig, client: MockClient, ranked: &[&str]) -> Harness {
        let client = Arc::new(client);
        let store = Arc::new(MemoryCacheStore::new());
        let publisher = CachePublisher::new(config.name.clone(), config.ttl(), store.clone());
        let events = EventBus::new(64);
        let fetcher = ChunkedFetcher::new(
            client.clone(),
            ChunkConfig {
                chunk_size: 2,
                chunk_delay_ms: 0,
                ..ChunkConfig::default()
            },
        );
        let ids: Arc<dyn IdentifierProvider> =
            Arc::new(StaticIdProvider::new(ranked.iter().copied()));
        let updater = Arc::new(TieredUpdater::new(
            &config,
            fetcher,
            publisher.clone(),
            ids,
            events.clone(),
        ));
        Harness {
            updater,
            client,
            store,
            publisher,
            events,
        }
    }

    fn endpoint() -> EndpointConfig {
        EndpointConfig::new("/simple/price?ids={{ids_list}}")
    }

    fn tiered(tiers: Vec<TierConfig>) -> FetcherConfig {
        let mut config = FetcherConfig::new("prices", endpoint());
        config.tiers = tiers;
        config
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn state(updater: &TieredUpdater, tier: &str) -> TierState {
        updater.read_states().get(tier).cloned().unwrap()
    }

    const RANKED: [&str; 3] = ["bitcoin", "ethereum", "solana"];

    #[tokio::test]
    async fn test_tier_fetches_its_slice_and_publishes() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 1, false)]),
            MockClient::new(),
            &RANKED,
        );
        let mut sub = h.events.subscribe();

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *h.client.requested.lock().unwrap(),
            vec!["bitcoin", "ethereum"]
        );
        let lookup = h
            .publisher
            .lookup(&ids(&["bitcoin", "litecoin"]))
            .await
            .unwrap();
        assert_eq!(lookup.status, CacheStatus::Partial);
        assert_eq!(lookup.missing, vec!["litecoin"]);
        assert!(h.updater.is_initialized());

        assert_eq!(
            sub.try_recv(),
            Some(RefreshEvent::ChunkStored {
                fetcher: "prices".to_string(),
                tier: "top".to_string(),
                items: 2
            })
        );
        assert_eq!(
            sub.try_recv(),
            Some(RefreshEvent::TierCompleted {
                fetcher: "prices".to_string(),
                tier: "top".to_string(),
                items: 2
            })
        );
    }

    #[tokio::test]
    async fn test_tier_beyond_list_is_skipped() {
        let h = harness(
            tiered(vec![tier("far", 10, 20, 60, false)]),
            MockClient::new(),
            &RANKED,
        );

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
        assert!(!h.updater.is_initialized());
        let far = state(&h.updater, "far");
        assert!(far.last_update.is_some());
        assert!(!far.is_updating);
    }

    #[tokio::test]
    async fn test_zero_yield_is_an_error() {
        let h = harness(
            tiered(vec![tier("top", 1, 3, 60, false)]),
            MockClient::omitting(&RANKED),
            &RANKED,
        );

        let result = h.updater.force_update(&CancellationToken::new()).await;

        assert!(matches!(result, Err(EngineError::RefreshFailed(ref names)) if names == &["top"]));
        assert!(!h.updater.is_initialized());
        let top = state(&h.updater, "top");
        assert!(top.last_update.is_none());
        assert!(!top.is_updating);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_update_and_cached_data() {
        let h = harness(
            tiered(vec![tier("top", 1, 3, 60, false)]),
            MockClient::new(),
            &RANKED,
        );
        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();
        let first_update = state(&h.updater, "top").last_update;

        h.client.fail.store(true, Ordering::SeqCst);
        let result = h.updater.force_update(&CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(state(&h.updater, "top").last_update, first_update);
        // Earlier data is still served
        assert_eq!(h.store.len(), 3);
        assert!(h.updater.is_initialized());
    }

    #[tokio::test]
    async fn test_failing_second_chunk_keeps_first_chunk_cached() {
        let client = MockClient {
            fail_on_call: Some(2),
            ..MockClient::new()
        };
        // chunk_size 2 over three ids: [bitcoin, ethereum] then [solana]
        let h = harness(tiered(vec![tier("top", 1, 3, 60, false)]), client, &RANKED);

        let result = h.updater.force_update(&CancellationToken::new()).await;

        assert!(matches!(result, Err(EngineError::RefreshFailed(ref names)) if names == &["top"]));
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 2);

        let first = h
            .publisher
            .lookup(&ids(&["bitcoin", "ethereum"]))
            .await
            .unwrap();
        assert_eq!(first.status, CacheStatus::Full);
        let second = h.publisher.lookup(&ids(&["solana"])).await.unwrap();
        assert_eq!(second.missing, vec!["solana"]);

        let top = state(&h.updater, "top");
        assert!(top.last_update.is_none());
        assert!(!top.is_updating);
        assert!(!h.updater.is_initialized());
    }

    #[tokio::test]
    async fn test_supplementary_ids_are_merged() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 60, true)]),
            MockClient::new(),
            &RANKED,
        );
        h.updater
            .set_supplementary_provider(Some(Arc::new(StaticIdProvider::new([
                "ethereum", "tether", "tether",
            ]))));
        let mut sub = h.events.subscribe();

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *h.client.requested.lock().unwrap(),
            vec!["bitcoin", "ethereum", "tether"]
        );
        let lookup = h.publisher.lookup(&ids(&["tether"])).await.unwrap();
        assert_eq!(lookup.status, CacheStatus::Full);

        let mut completed = None;
        while let Some(event) = sub.try_recv() {
            if event.is_completion() {
                completed = Some(event);
            }
        }
        assert_eq!(
            completed,
            Some(RefreshEvent::TierCompleted {
                fetcher: "prices".to_string(),
                tier: "top".to_string(),
                items: 3
            })
        );
    }

    #[tokio::test]
    async fn test_supplementary_failure_does_not_fail_tier() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 60, true)]),
            MockClient::new(),
            &RANKED,
        );
        h.updater
            .set_supplementary_provider(Some(Arc::new(FailingProvider)));

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();
        assert!(h.updater.is_initialized());
    }

    #[tokio::test]
    async fn test_simple_mode_fetches_everything() {
        let config = FetcherConfig::new("prices", endpoint());
        let h = harness(config, MockClient::new(), &RANKED);
        let mut sub = h.events.subscribe();

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.client.requested.lock().unwrap().len(), 3);
        let mut completed = None;
        while let Some(event) = sub.try_recv() {
            if event.is_completion() {
                completed = Some(event);
            }
        }
        assert_eq!(
            completed,
            Some(RefreshEvent::RefreshCompleted {
                fetcher: "prices".to_string(),
                items: 3
            })
        );
        assert_eq!(h.updater.tier_statuses()[0].name, SIMPLE_TIER_NAME);
    }

    #[tokio::test]
    async fn test_provider_failure_is_reported() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 60, false)]),
            MockClient::new(),
            &RANKED,
        );
        h.updater.set_id_provider(Arc::new(FailingProvider));

        let result = h.updater.force_update(&CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_update_skips_busy_tier() {
        let h = harness(
            tiered(vec![
                tier("top", 1, 1, 60, false),
                tier("rest", 2, 3, 60, false),
            ]),
            MockClient::new(),
            &RANKED,
        );
        h.updater
            .write_states()
            .get_mut("top")
            .unwrap()
            .begin(Instant::now());

        h.updater
            .force_update(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *h.client.requested.lock().unwrap(),
            vec!["ethereum", "solana"]
        );
        assert!(state(&h.updater, "top").is_updating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_tiers_respects_interval() {
        let h = harness(
            tiered(vec![
                tier("fast", 1, 1, 5, false),
                tier("slow", 2, 3, 3600, false),
            ]),
            MockClient::new(),
            &RANKED,
        );
        let cancel = CancellationToken::new();

        let mut launched = h.updater.check_tiers(&cancel);
        launched.sort();
        assert_eq!(launched, vec!["fast", "slow"]);

        // Let the spawned refreshes finish
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.updater.check_tiers(&cancel).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(h.updater.check_tiers(&cancel), vec!["fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_stuck_tier() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 60, false)]),
            MockClient::new(),
            &RANKED,
        );
        let started = Instant::now();
        h.updater
            .write_states()
            .get_mut("top")
            .unwrap()
            .begin(started);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(h.updater.run_watchdog(Instant::now()).is_empty());
        assert!(h.updater.check_tiers(&CancellationToken::new()).is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        // Released and relaunched on the same tick
        assert_eq!(
            h.updater.check_tiers(&CancellationToken::new()),
            vec!["top"]
        );
        let top = state(&h.updater, "top");
        assert!(top.is_updating);
        assert_ne!(top.update_start_time, Some(started));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let h = harness(
            tiered(vec![tier("top", 1, 2, 60, false)]),
            MockClient::new(),
            &RANKED,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&h.updater).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.updater.is_initialized());

        cancel.cancel();
        handle.await.unwrap();
    }
}
