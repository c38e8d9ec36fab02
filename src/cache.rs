//! Object Cache
//!
//! Process-local grouped key/value cache shared by the option and metadata
//! stores. Entries are addressed by `(key, group)`.

use crate::meta::MetaMap;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cache groups used by the stores
pub mod groups {
    pub const OPTIONS: &str = "options";
    pub const SITE_OPTIONS: &str = "site-options";

    /// Group holding per-object metadata for a meta type
    pub fn meta(meta_type: &str) -> String {
        format!("{}_meta", meta_type)
    }
}

/// Reserved keys inside the `options` group
pub mod keys {
    pub const ALLOPTIONS: &str = "alloptions";
    pub const NOTOPTIONS: &str = "notoptions";
}

/// A cached entry
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Raw stored string of a single option row
    Raw(String),
    /// Already deserialized value
    Value(Value),
    /// Autoloaded options, name to raw stored string
    Options(Arc<HashMap<String, String>>),
    /// Names known to be absent from storage
    NotFound(HashSet<String>),
    /// Whole metadata multimap of one object
    Meta(MetaMap),
}

impl CacheValue {
    pub fn into_raw(self) -> Option<String> {
        match self {
            CacheValue::Raw(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            CacheValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_options(self) -> Option<Arc<HashMap<String, String>>> {
        match self {
            CacheValue::Options(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_not_found(self) -> Option<HashSet<String>> {
        match self {
            CacheValue::NotFound(set) => Some(set),
            _ => None,
        }
    }

    pub fn into_meta(self) -> Option<MetaMap> {
        match self {
            CacheValue::Meta(map) => Some(map),
            _ => None,
        }
    }
}

// ============================================
// Cache Trait
// ============================================

/// Grouped object cache
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// Get an entry
    async fn get(&self, key: &str, group: &str) -> Option<CacheValue>;

    /// Set an entry, replacing any existing one
    async fn set(&self, key: &str, value: CacheValue, group: &str);

    /// Set an entry only if absent. Returns whether it was stored.
    async fn add(&self, key: &str, value: CacheValue, group: &str) -> bool;

    /// Remove an entry. Returns whether it existed.
    async fn delete(&self, key: &str, group: &str) -> bool;

    /// Get several entries of one group, in key order
    async fn get_multiple(&self, keys: &[String], group: &str) -> Vec<(String, Option<CacheValue>)> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key, group).await));
        }
        out
    }

    /// Add several entries of one group
    async fn add_multiple(&self, entries: Vec<(String, CacheValue)>, group: &str) {
        for (key, value) in entries {
            self.add(&key, value, group).await;
        }
    }

    /// Remove several entries of one group
    async fn delete_multiple(&self, keys: &[String], group: &str) {
        for key in keys {
            self.delete(key, group).await;
        }
    }

    /// Drop every entry of a group
    async fn flush_group(&self, group: &str);

    /// Drop everything
    async fn flush(&self);
}

// ============================================
// In-Memory Cache
// ============================================

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// In-process cache keyed by `(group, key)`
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(String, String), CacheValue>>,
    stats: CacheStats,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn slot(key: &str, group: &str) -> (String, String) {
    (group.to_string(), key.to_string())
}

#[async_trait]
impl ObjectCache for MemoryCache {
    async fn get(&self, key: &str, group: &str) -> Option<CacheValue> {
        let entries = self.entries.read().await;
        match entries.get(&slot(key, group)) {
            Some(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: CacheValue, group: &str) {
        self.entries.write().await.insert(slot(key, group), value);
    }

    async fn add(&self, key: &str, value: CacheValue, group: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.entry(slot(key, group)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(value);
                true
            }
        }
    }

    async fn delete(&self, key: &str, group: &str) -> bool {
        self.entries.write().await.remove(&slot(key, group)).is_some()
    }

    async fn flush_group(&self, group: &str) {
        self.entries.write().await.retain(|(g, _), _| g != group);
    }

    async fn flush(&self) {
        self.entries.write().await.clear();
        tracing::debug!("Object cache flushed");
    }
}
