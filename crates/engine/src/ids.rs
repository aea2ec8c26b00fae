//! Identifier providers.
//!
//! The ranked identifier list comes from outside the engine. Providers are
//! consulted on every refresh and may be swapped at runtime.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::warn;

use crate::errors::Result;

/// Source of ranked identifiers.
#[async_trait]
pub trait IdentifierProvider: Send + Sync {
    /// Up to `limit` identifiers in rank order. `0` means all of them.
    async fn get_ids(&self, limit: usize) -> Result<Vec<String>>;
}

/// Fixed in-memory ranking, replaceable with [`StaticIdProvider::set_ids`].
#[derive(Default)]
pub struct StaticIdProvider {
    ids: RwLock<Vec<String>>,
}

impl StaticIdProvider {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set_ids(&self, ids: Vec<String>) {
        let mut guard = self.ids.write().unwrap_or_else(|poisoned| {
            warn!("Identifier list lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = ids;
    }
}

#[async_trait]
impl IdentifierProvider for StaticIdProvider {
    async fn get_ids(&self, limit: usize) -> Result<Vec<String>> {
        let ids = self.ids.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let take = if limit == 0 { ids.len() } else { limit.min(ids.len()) };
        Ok(ids[..take].to_vec())
    }
}

/// Runtime-swappable provider handle.
///
/// Readers clone the `Arc` out so a refresh keeps using the provider it
/// started with even if another one is installed mid-flight.
#[derive(Default)]
pub(crate) struct ProviderSlot {
    inner: RwLock<Option<Arc<dyn IdentifierProvider>>>,
}

impl ProviderSlot {
    pub fn new(provider: Option<Arc<dyn IdentifierProvider>>) -> Self {
        Self {
            inner: RwLock::new(provider),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn IdentifierProvider>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, provider: Option<Arc<dyn IdentifierProvider>>) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| {
            warn!("Provider slot lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = provider;
    }
}
