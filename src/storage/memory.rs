//! In-Memory Storage
//!
//! Backend holding every table in process memory. Each repository call is
//! counted in [`QueryStats`], which is how cache coherency is observed in
//! tests.

use super::{MetaRepo, MetaRow, NetworkOptionRepo, OptionRepo};
use crate::error::StoreResult;
use crate::meta_types::MetaTypeConfig;
use crate::options::{is_autoloaded, Autoload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Per-table query counters
#[derive(Debug, Default)]
pub struct QueryStats {
    option_queries: AtomicU64,
    site_option_queries: AtomicU64,
    meta_queries: AtomicU64,
}

impl QueryStats {
    pub fn option_queries(&self) -> u64 {
        self.option_queries.load(Ordering::Relaxed)
    }

    pub fn site_option_queries(&self) -> u64 {
        self.site_option_queries.load(Ordering::Relaxed)
    }

    pub fn meta_queries(&self) -> u64 {
        self.meta_queries.load(Ordering::Relaxed)
    }

    fn option(&self) {
        self.option_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn site_option(&self) {
        self.site_option_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn meta(&self) {
        self.meta_queries.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct OptionRow {
    value: String,
    autoload: String,
}

#[derive(Debug, Clone)]
struct SiteMetaRow {
    site_id: u64,
    key: String,
    value: String,
}

#[derive(Debug, Default)]
struct MetaTable {
    next_id: u64,
    rows: Vec<MetaRow>,
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    options: RwLock<HashMap<String, OptionRow>>,
    sitemeta: RwLock<Vec<SiteMetaRow>>,
    meta: RwLock<HashMap<String, MetaTable>>,
    stats: QueryStats,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Insert an option row directly, bypassing every cache
    pub async fn seed_option(&self, name: &str, value: &str, autoload: &str) {
        self.options.write().await.insert(
            name.to_string(),
            OptionRow {
                value: value.to_string(),
                autoload: autoload.to_string(),
            },
        );
    }

    /// Number of rows in a meta table
    pub async fn meta_row_count(&self, table: &MetaTypeConfig) -> usize {
        self.meta
            .read()
            .await
            .get(&table.table_name)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl OptionRepo for MemoryStorage {
    async fn load_autoloaded(&self) -> StoreResult<Vec<(String, String)>> {
        self.stats.option();
        Ok(self
            .options
            .read()
            .await
            .iter()
            .filter(|(_, row)| is_autoloaded(&row.autoload))
            .map(|(name, row)| (name.clone(), row.value.clone()))
            .collect())
    }

    async fn get_option(&self, name: &str) -> StoreResult<Option<String>> {
        self.stats.option();
        Ok(self.options.read().await.get(name).map(|row| row.value.clone()))
    }

    async fn get_options(&self, names: &[String]) -> StoreResult<Vec<(String, String)>> {
        self.stats.option();
        let options = self.options.read().await;
        Ok(names
            .iter()
            .filter_map(|name| options.get(name).map(|row| (name.clone(), row.value.clone())))
            .collect())
    }

    async fn option_autoload(&self, name: &str) -> StoreResult<Option<String>> {
        self.stats.option();
        Ok(self.options.read().await.get(name).map(|row| row.autoload.clone()))
    }

    async fn upsert_option(&self, name: &str, value: &str, autoload: Autoload) -> StoreResult<bool> {
        self.stats.option();
        self.options.write().await.insert(
            name.to_string(),
            OptionRow {
                value: value.to_string(),
                autoload: autoload.as_str().to_string(),
            },
        );
        Ok(true)
    }

    async fn update_option(
        &self,
        name: &str,
        value: &str,
        autoload: Option<Autoload>,
    ) -> StoreResult<bool> {
        self.stats.option();
        let mut options = self.options.write().await;
        match options.get_mut(name) {
            Some(row) => {
                row.value = value.to_string();
                if let Some(autoload) = autoload {
                    row.autoload = autoload.as_str().to_string();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_option(&self, name: &str) -> StoreResult<bool> {
        self.stats.option();
        Ok(self.options.write().await.remove(name).is_some())
    }
}

#[async_trait]
impl NetworkOptionRepo for MemoryStorage {
    async fn get_site_option(&self, network_id: u64, name: &str) -> StoreResult<Option<String>> {
        self.stats.site_option();
        Ok(self
            .sitemeta
            .read()
            .await
            .iter()
            .find(|row| row.site_id == network_id && row.key == name)
            .map(|row| row.value.clone()))
    }

    async fn site_option_exists(&self, network_id: u64, name: &str) -> StoreResult<bool> {
        self.stats.site_option();
        Ok(self
            .sitemeta
            .read()
            .await
            .iter()
            .any(|row| row.site_id == network_id && row.key == name))
    }

    async fn insert_site_option(
        &self,
        network_id: u64,
        name: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.stats.site_option();
        self.sitemeta.write().await.push(SiteMetaRow {
            site_id: network_id,
            key: name.to_string(),
            value: value.to_string(),
        });
        Ok(true)
    }

    async fn update_site_option(
        &self,
        network_id: u64,
        name: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.stats.site_option();
        let mut rows = self.sitemeta.write().await;
        let mut changed = false;
        for row in rows
            .iter_mut()
            .filter(|row| row.site_id == network_id && row.key == name)
        {
            row.value = value.to_string();
            changed = true;
        }
        Ok(changed)
    }

    async fn delete_site_option(&self, network_id: u64, name: &str) -> StoreResult<bool> {
        self.stats.site_option();
        let mut rows = self.sitemeta.write().await;
        let before = rows.len();
        rows.retain(|row| !(row.site_id == network_id && row.key == name));
        Ok(rows.len() != before)
    }
}

#[async_trait]
impl MetaRepo for MemoryStorage {
    async fn fetch_meta(
        &self,
        table: &MetaTypeConfig,
        object_ids: &[u64],
    ) -> StoreResult<Vec<MetaRow>> {
        self.stats.meta();
        let meta = self.meta.read().await;
        let mut rows: Vec<MetaRow> = meta
            .get(&table.table_name)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| object_ids.contains(&row.object_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|row| row.meta_id);
        Ok(rows)
    }

    async fn count_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
    ) -> StoreResult<u64> {
        Ok(self.meta_ids(table, object_id, key).await?.len() as u64)
    }

    async fn meta_ids(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
    ) -> StoreResult<Vec<u64>> {
        self.stats.meta();
        let meta = self.meta.read().await;
        Ok(meta
            .get(&table.table_name)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| row.object_id == object_id && row.meta_key == key)
                    .map(|row| row.meta_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<u64> {
        self.stats.meta();
        let mut meta = self.meta.write().await;
        let t = meta.entry(table.table_name.clone()).or_default();
        t.next_id += 1;
        let meta_id = t.next_id;
        t.rows.push(MetaRow {
            meta_id,
            object_id,
            meta_key: key.to_string(),
            meta_value: value.to_string(),
        });
        Ok(meta_id)
    }

    async fn update_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
        prev_value: Option<&str>,
    ) -> StoreResult<u64> {
        self.stats.meta();
        let mut meta = self.meta.write().await;
        let mut changed = 0;
        if let Some(t) = meta.get_mut(&table.table_name) {
            for row in t.rows.iter_mut().filter(|row| {
                row.object_id == object_id
                    && row.meta_key == key
                    && prev_value.map_or(true, |prev| row.meta_value == prev)
            }) {
                row.meta_value = value.to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn find_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: Option<u64>,
        key: &str,
        value: Option<&str>,
    ) -> StoreResult<Vec<(u64, u64)>> {
        self.stats.meta();
        let meta = self.meta.read().await;
        Ok(meta
            .get(&table.table_name)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| {
                        row.meta_key == key
                            && object_id.map_or(true, |id| row.object_id == id)
                            && value.map_or(true, |v| row.meta_value == v)
                    })
                    .map(|row| (row.meta_id, row.object_id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_meta_ids(&self, table: &MetaTypeConfig, meta_ids: &[u64]) -> StoreResult<u64> {
        self.stats.meta();
        let mut meta = self.meta.write().await;
        let Some(t) = meta.get_mut(&table.table_name) else {
            return Ok(0);
        };
        let before = t.rows.len();
        t.rows.retain(|row| !meta_ids.contains(&row.meta_id));
        Ok((before - t.rows.len()) as u64)
    }

    async fn get_meta_by_id(
        &self,
        table: &MetaTypeConfig,
        meta_id: u64,
    ) -> StoreResult<Option<MetaRow>> {
        self.stats.meta();
        let meta = self.meta.read().await;
        Ok(meta
            .get(&table.table_name)
            .and_then(|t| t.rows.iter().find(|row| row.meta_id == meta_id).cloned()))
    }

    async fn update_meta_by_id(
        &self,
        table: &MetaTypeConfig,
        meta_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.stats.meta();
        let mut meta = self.meta.write().await;
        let row = meta
            .get_mut(&table.table_name)
            .and_then(|t| t.rows.iter_mut().find(|row| row.meta_id == meta_id));
        match row {
            Some(row) => {
                row.meta_key = key.to_string();
                row.meta_value = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_types::MetaTypeRegistry;

    #[tokio::test]
    async fn test_option_rows() {
        let storage = MemoryStorage::new();
        storage.upsert_option("a", "1", Autoload::Yes).await.unwrap();
        storage.upsert_option("b", "2", Autoload::No).await.unwrap();

        let autoloaded = storage.load_autoloaded().await.unwrap();
        assert_eq!(autoloaded, vec![("a".to_string(), "1".to_string())]);

        assert!(storage.update_option("b", "3", Some(Autoload::Yes)).await.unwrap());
        assert!(!storage.update_option("c", "3", None).await.unwrap());
        assert_eq!(storage.option_autoload("b").await.unwrap().as_deref(), Some("yes"));

        assert!(storage.delete_option("a").await.unwrap());
        assert_eq!(storage.get_option("a").await.unwrap(), None);
        assert_eq!(storage.stats().option_queries(), 8);
    }

    #[tokio::test]
    async fn test_meta_rows() {
        let storage = MemoryStorage::new();
        let registry = MetaTypeRegistry::with_defaults("wp_");
        let posts = registry.get("post").unwrap();

        let first = storage.insert_meta(posts, 1, "k", "a").await.unwrap();
        let second = storage.insert_meta(posts, 1, "k", "b").await.unwrap();
        storage.insert_meta(posts, 2, "k", "a").await.unwrap();
        assert!(second > first);

        assert_eq!(storage.count_meta(posts, 1, "k").await.unwrap(), 2);
        assert_eq!(
            storage.find_meta(posts, None, "k", Some("a")).await.unwrap().len(),
            2
        );
        assert_eq!(
            storage.update_meta(posts, 1, "k", "z", Some("b")).await.unwrap(),
            1
        );

        let rows = storage.fetch_meta(posts, &[1]).await.unwrap();
        let values: Vec<_> = rows.iter().map(|r| r.meta_value.as_str()).collect();
        assert_eq!(values, vec!["a", "z"]);

        assert_eq!(storage.delete_meta_ids(posts, &[first]).await.unwrap(), 1);
        assert_eq!(storage.meta_row_count(posts).await, 2);
    }
}
