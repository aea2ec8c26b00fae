//! Per-fetcher facade used by domain services.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use pricecache_upstream::{
    BatchClient, ChunkedFetcher, CredentialSet, KeyRotator, RetryTransport, UpstreamClient,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachePublisher, CacheStatus, CacheStore, Lookup};
use crate::config::FetcherConfig;
use crate::errors::{EngineError, Result};
use crate::events::{EventBus, Subscription};
use crate::ids::IdentifierProvider;
use crate::tiers::TierStatus;
use crate::updater::TieredUpdater;

/// One configured upstream dataset: its schedule, its cache slice and its
/// read API.
pub struct MarketDataFetcher {
    config: FetcherConfig,
    client: Arc<dyn BatchClient>,
    publisher: CachePublisher,
    updater: Arc<TieredUpdater>,
    events: EventBus,
}

impl MarketDataFetcher {
    /// Validate `config` and wire the fetcher around `client`.
    pub fn new(
        config: FetcherConfig,
        client: Arc<dyn BatchClient>,
        store: Arc<dyn CacheStore>,
        ids: Arc<dyn IdentifierProvider>,
    ) -> Result<Self> {
        Self::with_event_bus(config, client, store, ids, EventBus::default())
    }

    /// Like [`new`](Self::new), publishing to a shared `events` bus.
    pub fn with_event_bus(
        config: FetcherConfig,
        client: Arc<dyn BatchClient>,
        store: Arc<dyn CacheStore>,
        ids: Arc<dyn IdentifierProvider>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;

        let publisher = CachePublisher::new(config.name.clone(), config.ttl(), store);
        let fetcher = ChunkedFetcher::new(Arc::clone(&client), config.chunk.clone());
        let updater = Arc::new(TieredUpdater::new(
            &config,
            fetcher,
            publisher.clone(),
            ids,
            events.clone(),
        ));

        info!(
            "Fetcher '{}' configured ({})",
            config.name,
            if config.is_tiered() {
                format!("{} tier(s)", config.tiers.len())
            } else {
                format!("every {}s", config.update_interval_secs)
            }
        );

        Ok(Self {
            config,
            client,
            publisher,
            updater,
            events,
        })
    }

    /// Build the production HTTP client from `config` and `credentials`.
    pub fn from_upstream(
        config: FetcherConfig,
        credentials: CredentialSet,
        store: Arc<dyn CacheStore>,
        ids: Arc<dyn IdentifierProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let rotator = Arc::new(KeyRotator::new(
            credentials.credentials,
            config.rotator.clone(),
        ));
        let transport = Arc::new(RetryTransport::new(config.retry.clone())?);
        let client =
            UpstreamClient::new(config.name.clone(), &config.endpoint, rotator, transport)?;

        Self::new(config, Arc::new(client), store, ids)
    }

    pub fn with_supplementary_provider(self, provider: Arc<dyn IdentifierProvider>) -> Self {
        self.updater.set_supplementary_provider(Some(provider));
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Cached payload for `id`.
    ///
    /// On a miss with `read_through` enabled, the id is fetched from the
    /// upstream, cached and returned with [`CacheStatus::Miss`]. Without
    /// read-through a miss is [`EngineError::NotFound`].
    pub async fn get_by_id(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> Result<(Bytes, CacheStatus)> {
        if !self.config.read_through {
            let mut lookup = self.publisher.lookup(&[id.to_string()]).await?;
            return match lookup.found.remove(id) {
                Some(value) => Ok((value, CacheStatus::Full)),
                None => Err(EngineError::NotFound(id.to_string())),
            };
        }

        self.publisher
            .get_or_load(id, || async move {
                debug!("[{}] Reading through for '{}'", self.config.name, id);
                let ids = [id.to_string()];
                let mut data = self.client.fetch_chunk(cancel, &ids).await?;
                data.remove(id)
                    .ok_or_else(|| EngineError::NotFound(id.to_string()))
            })
            .await
    }

    /// Cached payloads for `ids`. Never touches the upstream.
    pub async fn get_multiple(&self, ids: &[String]) -> Result<Lookup> {
        self.publisher.lookup(ids).await
    }

    /// Refresh every idle tier now and wait for the result.
    pub async fn force_update(&self, cancel: &CancellationToken) -> Result<()> {
        self.updater.force_update(cancel).await
    }

    /// True once at least one refresh has completed.
    pub fn healthy(&self) -> bool {
        self.updater.is_initialized()
    }

    /// Spawn the scheduler. It stops when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.updater).run(cancel))
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn tier_statuses(&self) -> Vec<TierStatus> {
        self.updater.tier_statuses()
    }

    pub fn set_id_provider(&self, provider: Arc<dyn IdentifierProvider>) {
        self.updater.set_id_provider(provider);
    }

    pub fn set_supplementary_provider(&self, provider: Option<Arc<dyn IdentifierProvider>>) {
        self.updater.set_supplementary_provider(provider);
    }
}
