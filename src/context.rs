//! Site Context
//!
//! Everything the stores need for one site: configuration, storage, the
//! object cache, hooks and the meta type registry. Store views borrow it.

use crate::cache::ObjectCache;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::hooks::HookRegistry;
use crate::meta::MetadataStore;
use crate::meta_types::{MetaTypeConfig, MetaTypeRegistry};
use crate::network::NetworkOptionStore;
use crate::options::OptionStore;
use crate::storage::Storage;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Handle threaded through every store operation
pub struct SiteContext {
    pub config: StoreConfig,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn ObjectCache>,
    pub hooks: Arc<HookRegistry>,
    pub meta_types: MetaTypeRegistry,
    /// Held while an `alloptions`/`notoptions` blob is read, changed and
    /// written back
    pub(crate) blob_lock: Mutex<()>,
}

impl SiteContext {
    /// Create a context with an empty hook registry and the default meta types
    pub fn new(config: StoreConfig, storage: Arc<dyn Storage>, cache: Arc<dyn ObjectCache>) -> Self {
        let meta_types = MetaTypeRegistry::with_defaults(&config.table_prefix);
        Self {
            config,
            storage,
            cache,
            hooks: Arc::new(HookRegistry::new()),
            meta_types,
            blob_lock: Mutex::new(()),
        }
    }

    /// Share a hook registry with other contexts
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_meta_types(mut self, meta_types: MetaTypeRegistry) -> Self {
        self.meta_types = meta_types;
        self
    }

    /// Look up a meta type
    pub fn meta_type(&self, meta_type: &str) -> StoreResult<&MetaTypeConfig> {
        self.meta_types
            .get(meta_type)
            .ok_or_else(|| StoreError::UnknownMetaType(meta_type.to_string()))
    }

    pub fn options(&self) -> OptionStore<'_> {
        OptionStore::new(self)
    }

    pub fn network_options(&self) -> NetworkOptionStore<'_> {
        NetworkOptionStore::new(self)
    }

    pub fn metadata(&self) -> MetadataStore<'_> {
        MetadataStore::new(self)
    }
}

/// In-memory context for tests, returning the storage for query counting
#[cfg(test)]
pub(crate) fn test_context(
    config: StoreConfig,
) -> (SiteContext, Arc<crate::storage::MemoryStorage>) {
    test_context_with_cache(config, Arc::new(crate::cache::MemoryCache::new()))
}

#[cfg(test)]
pub(crate) fn test_context_with_cache(
    config: StoreConfig,
    cache: Arc<dyn ObjectCache>,
) -> (SiteContext, Arc<crate::storage::MemoryStorage>) {
    let storage = Arc::new(crate::storage::MemoryStorage::new());
    (SiteContext::new(config, storage.clone(), cache), storage)
}

/// Memory cache that yields to the scheduler before every call, so joined
/// futures interleave between a blob read and its write back
#[cfg(test)]
#[derive(Default)]
pub(crate) struct YieldingCache {
    inner: crate::cache::MemoryCache,
}

#[cfg(test)]
#[async_trait::async_trait]
impl ObjectCache for YieldingCache {
    async fn get(&self, key: &str, group: &str) -> Option<crate::cache::CacheValue> {
        tokio::task::yield_now().await;
        self.inner.get(key, group).await
    }

    async fn set(&self, key: &str, value: crate::cache::CacheValue, group: &str) {
        tokio::task::yield_now().await;
        self.inner.set(key, value, group).await
    }

    async fn add(&self, key: &str, value: crate::cache::CacheValue, group: &str) -> bool {
        tokio::task::yield_now().await;
        self.inner.add(key, value, group).await
    }

    async fn delete(&self, key: &str, group: &str) -> bool {
        tokio::task::yield_now().await;
        self.inner.delete(key, group).await
    }

    async fn flush_group(&self, group: &str) {
        self.inner.flush_group(group).await
    }

    async fn flush(&self) {
        self.inner.flush().await
    }
}
