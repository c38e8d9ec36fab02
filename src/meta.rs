//! Metadata Store
//!
//! Key/value metadata attached to objects (posts, terms, comments, users
//! and registered types). Several entries may share an object and key;
//! they are kept in insertion order.
//!
//! The whole multimap of an object is cached under `{type}_meta` keyed by
//! the object id and dropped on every write to that object.

use crate::cache::{groups, CacheValue};
use crate::context::SiteContext;
use crate::hooks::{Hook, HookContext};
use crate::meta_types::MetaTypeConfig;
use crate::serialize::{maybe_unserialize_str, to_storage};
use crate::storage::{MetaRepo, MetaRow};
use crate::value::{ArrayKey, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Meta key to raw stored values. Keys follow their first meta id, values
/// their own meta ids.
pub type MetaMap = IndexMap<String, Vec<String>>;

/// Outcome of a successful [`MetadataStore::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaUpdate {
    /// No entry existed; one was added with this meta id
    Inserted(u64),
    Updated,
}

/// A single metadata row with its value decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MetaEntry {
    pub meta_id: u64,
    pub object_id: u64,
    pub meta_key: String,
    pub meta_value: Value,
}

impl MetaEntry {
    fn from_row(row: MetaRow) -> Self {
        Self {
            meta_id: row.meta_id,
            object_id: row.object_id,
            meta_value: maybe_unserialize_str(&row.meta_value),
            meta_key: row.meta_key,
        }
    }

    /// Read an entry from an array or object carrying `meta_id`,
    /// `object_id`, `meta_key` and `meta_value`
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            meta_id: id_field(value, "meta_id")?,
            object_id: id_field(value, "object_id")?,
            meta_key: field(value, "meta_key")?.to_db_string(),
            meta_value: field(value, "meta_value").cloned().unwrap_or_default(),
        })
    }
}

fn field<'v>(value: &'v Value, name: &str) -> Option<&'v Value> {
    match value {
        Value::Array(_) => value.get(&ArrayKey::Str(name.to_string())),
        Value::Object { properties, .. } => properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v),
        _ => None,
    }
}

fn id_field(value: &Value, name: &str) -> Option<u64> {
    match field(value, name)? {
        Value::Int(n) if *n > 0 => Some(*n as u64),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Metadata operations over a [`SiteContext`]
#[derive(Clone, Copy)]
pub struct MetadataStore<'a> {
    ctx: &'a SiteContext,
}

impl<'a> MetadataStore<'a> {
    pub fn new(ctx: &'a SiteContext) -> Self {
        Self { ctx }
    }

    fn table(&self, meta_type: &str) -> Option<&'a MetaTypeConfig> {
        match self.ctx.meta_type(meta_type) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }

    /// Add an entry. Returns the new meta id, or `None` when rejected.
    pub async fn add(
        &self,
        meta_type: &str,
        object_id: u64,
        meta_key: &str,
        meta_value: Value,
        unique: bool,
    ) -> Option<u64> {
        if meta_key.is_empty() || object_id == 0 {
            return None;
        }
        let table = self.table(meta_type)?;
        let hooks = &self.ctx.hooks;

        let meta_value = self.sanitize(table, object_id, meta_key, meta_value).await;
        let mut ctx = HookContext {
            value: Some(meta_value.clone()),
            unique,
            ..HookContext::meta(meta_type, object_id, meta_key)
        };

        if let Some(result) = hooks
            .short_circuit(&Hook::AddMetadata(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return match result {
                Value::Int(id) if id > 0 => Some(id as u64),
                _ => None,
            };
        }

        if unique {
            match self.ctx.storage.count_meta(table, object_id, meta_key).await {
                Ok(0) => {}
                Ok(_) => return None,
                Err(e) => {
                    tracing::warn!(meta_type = %meta_type, object_id, "Failed to count metadata: {}", e);
                    return None;
                }
            }
        }

        let serialized = to_storage(&meta_value);
        hooks.do_action(&Hook::AddMeta(meta_type.to_string()), &ctx).await;

        let meta_id = match self
            .ctx
            .storage
            .insert_meta(table, object_id, meta_key, &serialized)
            .await
        {
            Ok(meta_id) => meta_id,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, object_id, "Failed to add metadata: {}", e);
                return None;
            }
        };

        self.invalidate(meta_type, &[object_id]).await;

        ctx.meta_ids = vec![meta_id];
        hooks.do_action(&Hook::AddedMeta(meta_type.to_string()), &ctx).await;
        Some(meta_id)
    }

    /// Update every entry with this key, or only those holding
    /// `prev_value`. Adds an entry when none exists.
    pub async fn update(
        &self,
        meta_type: &str,
        object_id: u64,
        meta_key: &str,
        meta_value: Value,
        prev_value: Option<Value>,
    ) -> Option<MetaUpdate> {
        if meta_key.is_empty() || object_id == 0 {
            return None;
        }
        let table = self.table(meta_type)?;
        let hooks = &self.ctx.hooks;

        let raw_value = meta_value.clone();
        let meta_value = self.sanitize(table, object_id, meta_key, meta_value).await;
        let mut ctx = HookContext {
            value: Some(meta_value.clone()),
            prev_value: prev_value.clone(),
            ..HookContext::meta(meta_type, object_id, meta_key)
        };

        if let Some(result) = hooks
            .short_circuit(&Hook::UpdateMetadata(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy().then_some(MetaUpdate::Updated);
        }

        let prev_value = prev_value.filter(Value::is_truthy);

        // A lone identical value is a no-op
        if prev_value.is_none() {
            if let Some(Value::Array(current)) =
                self.get_raw(meta_type, object_id, meta_key, false).await
            {
                if current.len() == 1 && current[0].1 == meta_value {
                    return None;
                }
            }
        }

        let meta_ids = match self.ctx.storage.meta_ids(table, object_id, meta_key).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, object_id, "Failed to read metadata: {}", e);
                return None;
            }
        };
        if meta_ids.is_empty() {
            return self
                .add(meta_type, object_id, meta_key, raw_value, false)
                .await
                .map(MetaUpdate::Inserted);
        }

        let serialized = to_storage(&meta_value);
        let prev_serialized = prev_value.as_ref().map(to_storage);

        ctx.meta_ids = meta_ids;
        hooks.do_action(&Hook::UpdateMeta(meta_type.to_string()), &ctx).await;

        match self
            .ctx
            .storage
            .update_meta(table, object_id, meta_key, &serialized, prev_serialized.as_deref())
            .await
        {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, object_id, "Failed to update metadata: {}", e);
                return None;
            }
        }

        self.invalidate(meta_type, &[object_id]).await;

        hooks.do_action(&Hook::UpdatedMeta(meta_type.to_string()), &ctx).await;
        Some(MetaUpdate::Updated)
    }

    /// Delete entries with this key, optionally only those holding
    /// `meta_value`. With `delete_all` the key is removed from every object
    /// of the type and `object_id` is ignored.
    pub async fn delete(
        &self,
        meta_type: &str,
        object_id: u64,
        meta_key: &str,
        meta_value: Option<Value>,
        delete_all: bool,
    ) -> bool {
        if meta_key.is_empty() || (object_id == 0 && !delete_all) {
            return false;
        }
        let Some(table) = self.table(meta_type) else {
            return false;
        };
        let hooks = &self.ctx.hooks;

        // null, false and "" match any value
        let meta_value = meta_value.filter(|v| {
            !matches!(v, Value::Null | Value::Bool(false)) && v.as_str() != Some("")
        });

        let mut ctx = HookContext {
            value: meta_value.clone(),
            delete_all,
            ..HookContext::meta(meta_type, object_id, meta_key)
        };

        if let Some(result) = hooks
            .short_circuit(&Hook::DeleteMetadata(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy();
        }

        let serialized = meta_value.as_ref().map(to_storage);
        let found = match self
            .ctx
            .storage
            .find_meta(
                table,
                (!delete_all).then_some(object_id),
                meta_key,
                serialized.as_deref(),
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, object_id, "Failed to find metadata: {}", e);
                return false;
            }
        };
        if found.is_empty() {
            return false;
        }

        let meta_ids: Vec<u64> = found.iter().map(|(meta_id, _)| *meta_id).collect();
        let mut object_ids: Vec<u64> = found.iter().map(|(_, object_id)| *object_id).collect();
        object_ids.sort_unstable();
        object_ids.dedup();

        ctx.meta_ids = meta_ids.clone();
        ctx.object_ids = object_ids.clone();
        hooks.do_action(&Hook::DeleteMeta(meta_type.to_string()), &ctx).await;

        let removed = match self.ctx.storage.delete_meta_ids(table, &meta_ids).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, object_id, "Failed to delete metadata: {}", e);
                return false;
            }
        };
        if removed == 0 {
            return false;
        }

        self.invalidate(meta_type, &object_ids).await;

        hooks.do_action(&Hook::DeletedMeta(meta_type.to_string()), &ctx).await;
        true
    }

    /// Get metadata, falling back to the registered default.
    ///
    /// An empty key returns the whole multimap of raw strings.
    pub async fn get(&self, meta_type: &str, object_id: u64, meta_key: &str, single: bool) -> Value {
        match self.get_raw(meta_type, object_id, meta_key, single).await {
            Some(value) => value,
            None => self.get_default(meta_type, object_id, meta_key, single).await,
        }
    }

    /// Get metadata without defaults. `None` means nothing is stored.
    pub async fn get_raw(
        &self,
        meta_type: &str,
        object_id: u64,
        meta_key: &str,
        single: bool,
    ) -> Option<Value> {
        if object_id == 0 || self.table(meta_type).is_none() {
            return Some(Value::Bool(false));
        }

        let ctx = HookContext {
            single,
            ..HookContext::meta(meta_type, object_id, meta_key)
        };
        if let Some(result) = self
            .ctx
            .hooks
            .short_circuit(&Hook::GetMetadata(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return match result {
                Value::Array(items) if single => items.into_iter().next().map(|(_, v)| v),
                other => Some(other),
            };
        }

        let meta = self.object_meta(meta_type, object_id).await;

        if meta_key.is_empty() {
            return Some(Value::map(meta.iter().map(|(key, values)| {
                (key.as_str(), Value::list(values.iter().map(String::as_str)))
            })));
        }

        let values = meta.get(meta_key)?;
        if single {
            values.first().map(|raw| maybe_unserialize_str(raw))
        } else {
            Some(Value::list(values.iter().map(|raw| maybe_unserialize_str(raw))))
        }
    }

    /// Default for a missing key: `""` when single, `[]` otherwise, through
    /// the `DefaultMetadata` filter
    pub async fn get_default(
        &self,
        meta_type: &str,
        object_id: u64,
        meta_key: &str,
        single: bool,
    ) -> Value {
        let ctx = HookContext {
            single,
            ..HookContext::meta(meta_type, object_id, meta_key)
        };
        let value = if single {
            Value::String(String::new())
        } else {
            Value::Array(Vec::new())
        };

        let value = self
            .ctx
            .hooks
            .apply_filters(&Hook::DefaultMetadata(meta_type.to_string()), &ctx, value)
            .await;

        if !single && !value.is_numeric_array() {
            Value::list([value])
        } else {
            value
        }
    }

    /// Whether any entry with this key exists
    pub async fn exists(&self, meta_type: &str, object_id: u64, meta_key: &str) -> bool {
        if object_id == 0 || self.table(meta_type).is_none() {
            return false;
        }

        let ctx = HookContext {
            single: true,
            ..HookContext::meta(meta_type, object_id, meta_key)
        };
        if let Some(result) = self
            .ctx
            .hooks
            .short_circuit(&Hook::GetMetadata(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy();
        }

        self.object_meta(meta_type, object_id)
            .await
            .contains_key(meta_key)
    }

    /// Load the multimaps of several objects into the cache.
    ///
    /// Only uncached ids are queried, all in one request. Objects without
    /// entries are cached as empty.
    pub async fn update_meta_cache(
        &self,
        meta_type: &str,
        object_ids: &[u64],
    ) -> Option<HashMap<u64, MetaMap>> {
        let table = self.table(meta_type)?;

        let mut ids: Vec<u64> = object_ids.iter().copied().filter(|id| *id > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return None;
        }

        let ctx = HookContext {
            meta_type: Some(meta_type.to_string()),
            object_ids: ids.clone(),
            ..HookContext::default()
        };
        if let Some(result) = self
            .ctx
            .hooks
            .short_circuit(&Hook::UpdateMetadataCache(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy().then(HashMap::new);
        }

        let group = groups::meta(meta_type);
        let keys: Vec<String> = ids.iter().map(u64::to_string).collect();
        let cached = self.ctx.cache.get_multiple(&keys, &group).await;

        let mut result = HashMap::new();
        let mut missing = Vec::new();
        for (id, (_, entry)) in ids.iter().zip(cached) {
            match entry.and_then(CacheValue::into_meta) {
                Some(meta) => {
                    result.insert(*id, meta);
                }
                None => missing.push(*id),
            }
        }
        if missing.is_empty() {
            return Some(result);
        }

        tracing::debug!(meta_type = %meta_type, count = missing.len(), "Metadata cache miss");
        let rows = match self.ctx.storage.fetch_meta(table, &missing).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, "Failed to load metadata: {}", e);
                return None;
            }
        };

        let mut fetched: HashMap<u64, MetaMap> =
            missing.iter().map(|id| (*id, MetaMap::new())).collect();
        for row in rows {
            fetched
                .entry(row.object_id)
                .or_default()
                .entry(row.meta_key)
                .or_default()
                .push(row.meta_value);
        }

        self.ctx
            .cache
            .add_multiple(
                fetched
                    .iter()
                    .map(|(id, meta)| (id.to_string(), CacheValue::Meta(meta.clone())))
                    .collect(),
                &group,
            )
            .await;

        result.extend(fetched);
        Some(result)
    }

    /// Get one row by meta id
    pub async fn get_by_mid(&self, meta_type: &str, meta_id: u64) -> Option<MetaEntry> {
        if meta_id == 0 {
            return None;
        }
        let table = self.table(meta_type)?;

        let ctx = HookContext {
            meta_type: Some(meta_type.to_string()),
            meta_ids: vec![meta_id],
            ..HookContext::default()
        };
        if let Some(result) = self
            .ctx
            .hooks
            .short_circuit(&Hook::GetMetadataByMid(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return MetaEntry::from_value(&result);
        }

        match self.ctx.storage.get_meta_by_id(table, meta_id).await {
            Ok(row) => row.map(MetaEntry::from_row),
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, meta_id, "Failed to read metadata row: {}", e);
                None
            }
        }
    }

    /// Replace the value (and optionally the key) of one row
    pub async fn update_by_mid(
        &self,
        meta_type: &str,
        meta_id: u64,
        meta_value: Value,
        meta_key: Option<&str>,
    ) -> bool {
        if meta_id == 0 {
            return false;
        }
        let Some(table) = self.table(meta_type) else {
            return false;
        };
        let hooks = &self.ctx.hooks;

        let ctx = HookContext {
            name: meta_key.unwrap_or_default().to_string(),
            meta_type: Some(meta_type.to_string()),
            meta_ids: vec![meta_id],
            value: Some(meta_value.clone()),
            ..HookContext::default()
        };
        if let Some(result) = hooks
            .short_circuit(&Hook::UpdateMetadataByMid(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy();
        }

        let row = match self.ctx.storage.get_meta_by_id(table, meta_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, meta_id, "Failed to read metadata row: {}", e);
                return false;
            }
        };

        let meta_key = match meta_key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => row.meta_key.clone(),
        };
        let meta_value = self.sanitize(table, row.object_id, &meta_key, meta_value).await;
        let serialized = to_storage(&meta_value);

        let ctx = HookContext {
            value: Some(meta_value),
            meta_ids: vec![meta_id],
            ..HookContext::meta(meta_type, row.object_id, &meta_key)
        };
        hooks.do_action(&Hook::UpdateMeta(meta_type.to_string()), &ctx).await;

        match self
            .ctx
            .storage
            .update_meta_by_id(table, meta_id, &meta_key, &serialized)
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, meta_id, "Failed to update metadata row: {}", e);
                return false;
            }
        }

        self.invalidate(meta_type, &[row.object_id]).await;

        hooks.do_action(&Hook::UpdatedMeta(meta_type.to_string()), &ctx).await;
        true
    }

    /// Delete one row by meta id
    pub async fn delete_by_mid(&self, meta_type: &str, meta_id: u64) -> bool {
        if meta_id == 0 {
            return false;
        }
        let Some(table) = self.table(meta_type) else {
            return false;
        };
        let hooks = &self.ctx.hooks;

        let ctx = HookContext {
            meta_type: Some(meta_type.to_string()),
            meta_ids: vec![meta_id],
            ..HookContext::default()
        };
        if let Some(result) = hooks
            .short_circuit(&Hook::DeleteMetadataByMid(meta_type.to_string()), &ctx, Value::Null)
            .await
        {
            return result.is_truthy();
        }

        let row = match self.ctx.storage.get_meta_by_id(table, meta_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, meta_id, "Failed to read metadata row: {}", e);
                return false;
            }
        };

        let ctx = HookContext {
            meta_ids: vec![meta_id],
            object_ids: vec![row.object_id],
            ..HookContext::meta(meta_type, row.object_id, &row.meta_key)
        };
        hooks.do_action(&Hook::DeleteMeta(meta_type.to_string()), &ctx).await;

        let removed = match self.ctx.storage.delete_meta_ids(table, &[meta_id]).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                tracing::warn!(meta_type = %meta_type, meta_id, "Failed to delete metadata row: {}", e);
                false
            }
        };

        self.invalidate(meta_type, &[row.object_id]).await;

        if removed {
            hooks.do_action(&Hook::DeletedMeta(meta_type.to_string()), &ctx).await;
        }
        removed
    }

    // ============================================
    // Internals
    // ============================================

    /// Cached multimap of one object, loading it on a miss
    async fn object_meta(&self, meta_type: &str, object_id: u64) -> MetaMap {
        let cached = self
            .ctx
            .cache
            .get(&object_id.to_string(), &groups::meta(meta_type))
            .await
            .and_then(CacheValue::into_meta);
        if let Some(meta) = cached {
            return meta;
        }

        self.update_meta_cache(meta_type, &[object_id])
            .await
            .and_then(|mut all| all.remove(&object_id))
            .unwrap_or_default()
    }

    async fn invalidate(&self, meta_type: &str, object_ids: &[u64]) {
        let keys: Vec<String> = object_ids.iter().map(u64::to_string).collect();
        self.ctx
            .cache
            .delete_multiple(&keys, &groups::meta(meta_type))
            .await;
    }

    /// Subtype-specific sanitize filter when one is registered, otherwise
    /// the per-key filter
    async fn sanitize(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        meta_key: &str,
        value: Value,
    ) -> Value {
        let hooks = &self.ctx.hooks;
        let ctx = HookContext::meta(&table.meta_type, object_id, meta_key);

        if let Some(subtype) = table.object_subtype(object_id).await {
            let hook = Hook::SanitizeMeta {
                meta_type: table.meta_type.clone(),
                meta_key: meta_key.to_string(),
                subtype: Some(subtype),
            };
            if hooks.has_filter(&hook).await {
                return hooks.apply_filters(&hook, &ctx, value).await;
            }
        }

        let hook = Hook::SanitizeMeta {
            meta_type: table.meta_type.clone(),
            meta_key: meta_key.to_string(),
            subtype: None,
        };
        hooks.apply_filters(&hook, &ctx, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::context::test_context;
    use crate::hooks::{priority, HookError};
    use crate::meta_types::{MetaTypeRegistry, StaticSubtypes};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_multimap_keeps_insertion_order() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        meta.add("post", 1, "color", "red".into(), false).await.unwrap();
        meta.add("post", 1, "color", "blue".into(), false).await.unwrap();
        meta.add("post", 1, "size", Value::Int(3), false).await.unwrap();

        assert_eq!(
            meta.get("post", 1, "color", false).await,
            Value::list(["red", "blue"])
        );
        assert_eq!(meta.get("post", 1, "color", true).await, Value::from("red"));
        assert_eq!(meta.get("post", 1, "size", true).await, Value::from("3"));
    }

    #[tokio::test]
    async fn test_unique_add_conflict() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        assert!(meta.add("user", 7, "nickname", "al".into(), true).await.is_some());
        assert_eq!(meta.add("user", 7, "nickname", "bo".into(), true).await, None);
        assert_eq!(meta.get("user", 7, "nickname", false).await, Value::list(["al"]));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        assert_eq!(meta.add("post", 0, "k", "v".into(), false).await, None);
        assert_eq!(meta.add("post", 1, "", "v".into(), false).await, None);
        assert_eq!(meta.add("widget", 1, "k", "v".into(), false).await, None);
        assert!(!meta.delete("post", 0, "k", None, false).await);
        assert_eq!(meta.get("widget", 1, "k", true).await, Value::Bool(false));
        assert!(!meta.exists("post", 0, "k").await);
    }

    #[tokio::test]
    async fn test_delete_by_value() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        meta.add("post", 1, "tag", "a".into(), false).await;
        meta.add("post", 1, "tag", "b".into(), false).await;
        meta.add("post", 1, "tag", "a".into(), false).await;

        assert!(meta.delete("post", 1, "tag", Some("a".into()), false).await);
        assert_eq!(meta.get("post", 1, "tag", false).await, Value::list(["b"]));

        assert!(!meta.delete("post", 1, "tag", Some("zzz".into()), false).await);

        // "" matches any value
        assert!(meta.delete("post", 1, "tag", Some("".into()), false).await);
        assert!(!meta.exists("post", 1, "tag").await);
    }

    #[tokio::test]
    async fn test_delete_all_objects() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        meta.add("post", 1, "_lock", "x".into(), false).await;
        meta.add("post", 2, "_lock", "y".into(), false).await;
        meta.add("post", 2, "keep", "z".into(), false).await;

        // Warm both caches
        assert!(meta.exists("post", 1, "_lock").await);
        assert!(meta.exists("post", 2, "_lock").await);

        assert!(meta.delete("post", 0, "_lock", None, true).await);
        assert!(!meta.exists("post", 1, "_lock").await);
        assert!(!meta.exists("post", 2, "_lock").await);
        assert!(meta.exists("post", 2, "keep").await);
        assert_eq!(
            storage.meta_row_count(ctx.meta_type("post").unwrap()).await,
            1
        );
    }

    #[tokio::test]
    async fn test_update_semantics() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        let inserted = meta.update("post", 5, "price", Value::Int(10), None).await;
        assert!(matches!(inserted, Some(MetaUpdate::Inserted(_))));

        // Same lone value
        assert_eq!(meta.update("post", 5, "price", "10".into(), None).await, None);

        assert_eq!(
            meta.update("post", 5, "price", Value::Int(12), None).await,
            Some(MetaUpdate::Updated)
        );
        assert_eq!(meta.get("post", 5, "price", true).await, Value::from("12"));

        meta.add("post", 5, "price", Value::Int(20), false).await;
        assert_eq!(
            meta.update("post", 5, "price", Value::Int(25), Some(Value::Int(20)))
                .await,
            Some(MetaUpdate::Updated)
        );
        assert_eq!(
            meta.get("post", 5, "price", false).await,
            Value::list(["12", "25"])
        );

        // Previous value that matches nothing
        assert_eq!(
            meta.update("post", 5, "price", Value::Int(1), Some(Value::Int(99)))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_structured_values_round_trip() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();
        let value = Value::map([("w", Value::Int(640)), ("h", Value::Int(480))]);

        meta.add("post", 9, "_dimensions", value.clone(), false).await;
        assert_eq!(meta.get("post", 9, "_dimensions", true).await, value);
    }

    #[tokio::test]
    async fn test_defaults() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        assert_eq!(meta.get("post", 1, "missing", true).await, Value::from(""));
        assert_eq!(meta.get("post", 1, "missing", false).await, Value::Array(vec![]));

        ctx.hooks
            .add_filter(
                Hook::DefaultMetadata("post".into()),
                |ctx: HookContext, v: Value| async move {
                    if ctx.name == "rating" {
                        Ok::<_, HookError>(Value::Int(5))
                    } else {
                        Ok(v)
                    }
                },
                priority::NORMAL,
            )
            .await;

        assert_eq!(meta.get("post", 1, "rating", true).await, Value::Int(5));
        assert_eq!(
            meta.get("post", 1, "rating", false).await,
            Value::list([Value::Int(5)])
        );
    }

    #[tokio::test]
    async fn test_whole_multimap() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        meta.add("term", 3, "b", "2".into(), false).await;
        meta.add("term", 3, "a", Value::list([1i64]), false).await;
        meta.add("term", 3, "b", "3".into(), false).await;

        // Keys in order of their first meta id
        assert_eq!(
            meta.get("term", 3, "", false).await,
            Value::map([
                ("b", Value::list(["2", "3"])),
                ("a", Value::list(["a:1:{i:0;i:1;}"])),
            ])
        );
    }

    #[tokio::test]
    async fn test_meta_cache_is_shared() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        meta.add("post", 1, "a", "x".into(), false).await;
        meta.add("post", 2, "a", "y".into(), false).await;

        let loaded = meta.update_meta_cache("post", &[1, 2, 3]).await.unwrap();
        assert_eq!(loaded[&1]["a"], vec!["x".to_string()]);
        assert!(loaded[&3].is_empty());

        let queries = storage.stats().meta_queries();
        assert_eq!(meta.get("post", 2, "a", true).await, Value::from("y"));
        assert!(!meta.exists("post", 3, "a").await);
        assert_eq!(storage.stats().meta_queries(), queries);
    }

    #[tokio::test]
    async fn test_by_mid() {
        let (ctx, _) = test_context(StoreConfig::default());
        let meta = ctx.metadata();

        let mid = meta.add("comment", 4, "rating", Value::Int(3), false).await.unwrap();
        let entry = meta.get_by_mid("comment", mid).await.unwrap();
        assert_eq!(entry.object_id, 4);
        assert_eq!(entry.meta_key, "rating");
        assert_eq!(entry.meta_value, Value::from("3"));

        assert!(meta.update_by_mid("comment", mid, Value::list(["x"]), Some("score")).await);
        assert_eq!(meta.get("comment", 4, "score", true).await, Value::list(["x"]));
        assert!(!meta.exists("comment", 4, "rating").await);

        assert!(meta.delete_by_mid("comment", mid).await);
        assert!(!meta.delete_by_mid("comment", mid).await);
        assert_eq!(meta.get_by_mid("comment", mid).await, None);
    }

    #[tokio::test]
    async fn test_short_circuits() {
        let (ctx, storage) = test_context(StoreConfig::default());
        ctx.hooks
            .add_short_circuit(
                Hook::GetMetadata("user".into()),
                |ctx: HookContext, _v| async move {
                    if ctx.name == "virtual" {
                        Ok::<_, HookError>(Some(Value::list(["computed", "ignored"])))
                    } else {
                        Ok(None)
                    }
                },
                priority::NORMAL,
            )
            .await;
        ctx.hooks
            .add_short_circuit(
                Hook::AddMetadata("user".into()),
                |_ctx, _v| async move { Ok::<_, HookError>(Some(Value::Int(42))) },
                priority::NORMAL,
            )
            .await;

        let meta = ctx.metadata();
        assert_eq!(meta.get("user", 1, "virtual", true).await, Value::from("computed"));
        assert!(meta.exists("user", 1, "virtual").await);

        assert_eq!(meta.add("user", 1, "k", "v".into(), false).await, Some(42));
        assert_eq!(
            storage.meta_row_count(ctx.meta_type("user").unwrap()).await,
            0
        );
    }

    #[tokio::test]
    async fn test_sanitize_prefers_subtype_filter() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let mut subtypes = HashMap::new();
        subtypes.insert(1, "product".to_string());
        let mut registry = MetaTypeRegistry::with_defaults("wp_");
        registry.register(MetaTypeConfig::conventional(
            "wp_",
            "post",
            Arc::new(StaticSubtypes(subtypes)),
        ));
        let ctx = SiteContext::new(ctx.config.clone(), storage, ctx.cache.clone())
            .with_meta_types(registry);

        ctx.hooks
            .add_filter(
                Hook::SanitizeMeta {
                    meta_type: "post".into(),
                    meta_key: "price".into(),
                    subtype: Some("product".into()),
                },
                |_ctx, _v| async move { Ok::<_, HookError>(Value::from("product")) },
                priority::NORMAL,
            )
            .await;
        ctx.hooks
            .add_filter(
                Hook::SanitizeMeta {
                    meta_type: "post".into(),
                    meta_key: "price".into(),
                    subtype: None,
                },
                |_ctx, _v| async move { Ok::<_, HookError>(Value::from("generic")) },
                priority::NORMAL,
            )
            .await;

        let meta = ctx.metadata();
        meta.add("post", 1, "price", "9".into(), false).await;
        meta.add("post", 2, "price", "9".into(), false).await;

        assert_eq!(meta.get("post", 1, "price", true).await, Value::from("product"));
        assert_eq!(meta.get("post", 2, "price", true).await, Value::from("generic"));
    }

    #[test]
    fn test_entry_from_value() {
        let value = Value::map([
            ("meta_id", Value::Int(3)),
            ("object_id", Value::from("8")),
            ("meta_key", Value::from("k")),
            ("meta_value", Value::Bool(true)),
        ]);
        assert_eq!(
            MetaEntry::from_value(&value),
            Some(MetaEntry {
                meta_id: 3,
                object_id: 8,
                meta_key: "k".into(),
                meta_value: Value::Bool(true),
            })
        );
        assert_eq!(MetaEntry::from_value(&Value::Bool(false)), None);
    }
}
