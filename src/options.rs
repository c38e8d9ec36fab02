//! Option Store
//!
//! Named site-wide settings with a two-tier cache:
//! - `alloptions`: every autoloaded option, loaded with one query
//! - per-name entries in the `options` group for the rest
//!
//! Names known to be absent are remembered under `notoptions` so repeated
//! misses never reach storage. A name is never in both `alloptions` and
//! `notoptions`.

use crate::cache::{groups, keys, CacheValue};
use crate::context::SiteContext;
use crate::error::{StoreError, StoreResult};
use crate::hooks::{Hook, HookContext};
use crate::serialize::{maybe_serialize, maybe_unserialize_str, to_storage};
use crate::storage::OptionRepo;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Stored autoload flags that count as autoloaded
pub const AUTOLOAD_VALUES: [&str; 4] = ["yes", "on", "auto-on", "auto"];

/// Renamed options, old name to current name
const LEGACY_NAMES: [(&str, &str); 2] = [
    ("blacklist_keys", "disallowed_keys"),
    ("comment_whitelist", "comment_previously_approved"),
];

/// Options whose stored value never carries a trailing slash
const UNTRAILED: [&str; 4] = ["siteurl", "home", "category_base", "tag_base"];

/// Whether a stored autoload flag is loaded with `alloptions`
pub fn is_autoloaded(flag: &str) -> bool {
    AUTOLOAD_VALUES.contains(&flag)
}

/// Autoload preference of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autoload {
    #[default]
    Yes,
    No,
}

impl Autoload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Autoload::Yes => "yes",
            Autoload::No => "no",
        }
    }
}

impl From<bool> for Autoload {
    fn from(autoload: bool) -> Self {
        if autoload {
            Autoload::Yes
        } else {
            Autoload::No
        }
    }
}

/// Outcome of a single lookup; an empty `home` defers to `siteurl`
enum Resolved {
    Value(Value),
    Siteurl,
}

/// Option operations over a [`SiteContext`]
#[derive(Clone, Copy)]
pub struct OptionStore<'a> {
    ctx: &'a SiteContext,
}

impl<'a> OptionStore<'a> {
    pub fn new(ctx: &'a SiteContext) -> Self {
        Self { ctx }
    }

    /// Get an option value.
    ///
    /// `default = None` means no default was passed; missing options then
    /// yield `false`.
    pub async fn get(&self, name: &str, default: Option<Value>) -> Value {
        match self.resolve(name, default).await {
            Resolved::Value(value) => value,
            Resolved::Siteurl => match self.resolve("siteurl", None).await {
                Resolved::Value(value) => value,
                Resolved::Siteurl => Value::Bool(false),
            },
        }
    }

    async fn resolve(&self, name: &str, default: Option<Value>) -> Resolved {
        let name = name.trim();
        if name.is_empty() {
            return Resolved::Value(Value::Bool(false));
        }
        let name = canonical_name(name);

        let hooks = &self.ctx.hooks;
        let ctx = HookContext {
            passed_default: default.is_some(),
            ..HookContext::option(name)
        };
        let default = default.unwrap_or(Value::Bool(false));

        if let Some(value) = hooks
            .short_circuit(&Hook::PreOption(name.to_string()), &ctx, default.clone())
            .await
        {
            return Resolved::Value(value);
        }
        if let Some(value) = hooks
            .short_circuit(&Hook::PreOptionAny, &ctx, default.clone())
            .await
        {
            return Resolved::Value(value);
        }

        if self.not_options().await.contains(name) {
            return Resolved::Value(self.filtered_default(name, &ctx, default).await);
        }

        let raw = match self.lookup(name).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.remember_missing(name).await;
                return Resolved::Value(self.filtered_default(name, &ctx, default).await);
            }
            Err(e) => {
                tracing::warn!(option = %name, "Option lookup failed: {}", e);
                return Resolved::Value(self.filtered_default(name, &ctx, default).await);
            }
        };

        if name == "home" && raw.is_empty() {
            return Resolved::Siteurl;
        }

        let raw = if UNTRAILED.contains(&name) {
            raw.trim_end_matches(['/', '\\']).to_string()
        } else {
            raw
        };

        Resolved::Value(
            hooks
                .apply_filters(
                    &Hook::OptionValue(name.to_string()),
                    &ctx,
                    maybe_unserialize_str(&raw),
                )
                .await,
        )
    }

    /// Update an option, creating it when absent.
    ///
    /// `autoload = None` keeps the stored flag on update and picks one by
    /// size on create. Returns `Ok(false)` when nothing changed.
    pub async fn update(
        &self,
        name: &str,
        value: Value,
        autoload: Option<Autoload>,
    ) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let name = canonical_name(name);
        self.guard(name)?;

        let hooks = &self.ctx.hooks;
        let value = self.sanitize(name, value).await;
        let old_value = self.get(name, None).await;

        let mut ctx = HookContext {
            old_value: Some(old_value.clone()),
            ..HookContext::option(name)
        };
        let value = hooks
            .apply_filters(&Hook::PreUpdateOption(name.to_string()), &ctx, value)
            .await;
        let value = hooks
            .apply_filters(&Hook::PreUpdateOptionAny, &ctx, value)
            .await;

        if value == old_value || maybe_serialize(&value) == maybe_serialize(&old_value) {
            return Ok(false);
        }

        if old_value == self.absent_marker(name).await {
            return self.add(name, value, autoload).await;
        }

        let serialized = to_storage(&value);
        ctx.value = Some(value);
        hooks.do_action(&Hook::UpdateOption, &ctx).await;

        match self
            .ctx
            .storage
            .update_option(name, &serialized, autoload)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                tracing::warn!(option = %name, "Failed to update option: {}", e);
                return Ok(false);
            }
        }

        self.forget_missing(name).await;
        self.store_in_tier(name, serialized, autoload).await;

        hooks.do_action(&Hook::UpdatedOption, &ctx).await;
        tracing::debug!(option = %name, "Option updated");
        Ok(true)
    }

    /// Add an option. Returns `Ok(false)` when it already exists.
    pub async fn add(
        &self,
        name: &str,
        value: Value,
        autoload: Option<Autoload>,
    ) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let name = canonical_name(name);
        self.guard(name)?;

        let hooks = &self.ctx.hooks;
        let value = self.sanitize(name, value).await;

        if !self.not_options().await.contains(name)
            && self.get(name, None).await != self.absent_marker(name).await
        {
            return Ok(false);
        }

        let serialized = to_storage(&value);
        let autoload = autoload.unwrap_or_else(|| {
            if serialized.len() > self.ctx.config.max_autoload_size {
                Autoload::No
            } else {
                Autoload::Yes
            }
        });

        let ctx = HookContext {
            value: Some(value),
            ..HookContext::option(name)
        };
        hooks.do_action(&Hook::AddOption, &ctx).await;

        match self
            .ctx
            .storage
            .upsert_option(name, &serialized, autoload)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                tracing::warn!(option = %name, "Failed to add option: {}", e);
                return Ok(false);
            }
        }

        self.store_in_tier(name, serialized, Some(autoload)).await;
        self.forget_missing(name).await;

        hooks.do_action(&Hook::AddedOption, &ctx).await;
        tracing::debug!(option = %name, autoload = autoload.as_str(), "Option added");
        Ok(true)
    }

    /// Delete an option. Returns `Ok(false)` when no row exists.
    pub async fn delete(&self, name: &str) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let name = canonical_name(name);
        self.guard(name)?;

        let autoload = match self.ctx.storage.option_autoload(name).await {
            Ok(Some(autoload)) => autoload,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(option = %name, "Failed to read option before delete: {}", e);
                return Ok(false);
            }
        };

        let hooks = &self.ctx.hooks;
        let ctx = HookContext::option(name);
        hooks.do_action(&Hook::DeleteOption, &ctx).await;

        let removed = match self.ctx.storage.delete_option(name).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(option = %name, "Failed to delete option: {}", e);
                false
            }
        };

        if is_autoloaded(&autoload) {
            let _blob = self.ctx.blob_lock.lock().await;
            let mut alloptions = self.load_autoloaded().await;
            if Arc::make_mut(&mut alloptions).remove(name).is_some() {
                self.ctx
                    .cache
                    .set(keys::ALLOPTIONS, CacheValue::Options(alloptions), groups::OPTIONS)
                    .await;
            }
        } else {
            self.ctx.cache.delete(name, groups::OPTIONS).await;
        }
        self.remember_missing(name).await;

        if removed {
            hooks.do_action(&Hook::DeletedOption, &ctx).await;
        }
        Ok(removed)
    }

    /// Every autoloaded option as raw stored strings, cached under
    /// `alloptions`
    pub async fn load_autoloaded(&self) -> Arc<HashMap<String, String>> {
        let cache = &self.ctx.cache;
        if let Some(alloptions) = cache
            .get(keys::ALLOPTIONS, groups::OPTIONS)
            .await
            .and_then(CacheValue::into_options)
        {
            return alloptions;
        }

        match self.ctx.storage.load_autoloaded().await {
            Ok(rows) => {
                let alloptions: Arc<HashMap<String, String>> = Arc::new(rows.into_iter().collect());
                tracing::debug!(count = alloptions.len(), "Loaded autoloaded options");
                cache
                    .add(
                        keys::ALLOPTIONS,
                        CacheValue::Options(alloptions.clone()),
                        groups::OPTIONS,
                    )
                    .await;
                alloptions
            }
            Err(e) => {
                tracing::warn!("Failed to load autoloaded options: {}", e);
                Arc::default()
            }
        }
    }

    /// Load several options into the cache with a single query
    pub async fn prime(&self, names: &[String]) {
        let alloptions = self.load_autoloaded().await;
        let not_options = self.not_options().await;

        let mut candidates: Vec<String> = Vec::new();
        for name in names {
            if !alloptions.contains_key(name)
                && !not_options.contains(name)
                && !candidates.contains(name)
            {
                candidates.push(name.clone());
            }
        }
        if candidates.is_empty() {
            return;
        }

        let to_load: Vec<String> = self
            .ctx
            .cache
            .get_multiple(&candidates, groups::OPTIONS)
            .await
            .into_iter()
            .filter(|(_, cached)| cached.is_none())
            .map(|(name, _)| name)
            .collect();
        if to_load.is_empty() {
            return;
        }

        let rows = match self.ctx.storage.get_options(&to_load).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to prime options: {}", e);
                return;
            }
        };

        let found: HashSet<&str> = rows.iter().map(|(name, _)| name.as_str()).collect();
        let missing: Vec<String> = to_load
            .iter()
            .filter(|name| !found.contains(name.as_str()))
            .cloned()
            .collect();

        self.ctx
            .cache
            .add_multiple(
                rows.into_iter()
                    .map(|(name, raw)| (name, CacheValue::Raw(raw)))
                    .collect(),
                groups::OPTIONS,
            )
            .await;

        if !missing.is_empty() {
            let _blob = self.ctx.blob_lock.lock().await;
            let mut not_options = self.not_options().await;
            not_options.extend(missing);
            self.ctx
                .cache
                .set(keys::NOTOPTIONS, CacheValue::NotFound(not_options), groups::OPTIONS)
                .await;
        }
    }

    /// Prime then get each option
    pub async fn get_many(&self, names: &[String]) -> Vec<(String, Value)> {
        self.prime(names).await;

        let mut values = Vec::with_capacity(names.len());
        for name in names {
            values.push((name.clone(), self.get(name, None).await));
        }
        values
    }

    // ============================================
    // Internals
    // ============================================

    /// Raw value from the blob, the per-name cache, then storage
    async fn lookup(&self, name: &str) -> StoreResult<Option<String>> {
        if let Some(raw) = self.load_autoloaded().await.get(name) {
            return Ok(Some(raw.clone()));
        }

        let cache = &self.ctx.cache;
        if let Some(raw) = cache
            .get(name, groups::OPTIONS)
            .await
            .and_then(CacheValue::into_raw)
        {
            return Ok(Some(raw));
        }

        tracing::debug!(option = %name, "Option cache miss, querying storage");
        let raw = self.ctx.storage.get_option(name).await?;
        if let Some(raw) = &raw {
            cache
                .add(name, CacheValue::Raw(raw.clone()), groups::OPTIONS)
                .await;
        }
        Ok(raw)
    }

    /// Put a freshly written value in the right cache tier
    async fn store_in_tier(&self, name: &str, serialized: String, autoload: Option<Autoload>) {
        let cache = &self.ctx.cache;
        let _blob = self.ctx.blob_lock.lock().await;
        let mut alloptions = self.load_autoloaded().await;

        let autoloaded = match autoload {
            Some(autoload) => autoload == Autoload::Yes,
            None => alloptions.contains_key(name),
        };

        if autoloaded {
            cache.delete(name, groups::OPTIONS).await;
            Arc::make_mut(&mut alloptions).insert(name.to_string(), serialized);
            cache
                .set(keys::ALLOPTIONS, CacheValue::Options(alloptions), groups::OPTIONS)
                .await;
        } else {
            if Arc::make_mut(&mut alloptions).remove(name).is_some() {
                cache
                    .set(keys::ALLOPTIONS, CacheValue::Options(alloptions), groups::OPTIONS)
                    .await;
            }
            cache
                .set(name, CacheValue::Raw(serialized), groups::OPTIONS)
                .await;
        }
    }

    async fn not_options(&self) -> HashSet<String> {
        self.ctx
            .cache
            .get(keys::NOTOPTIONS, groups::OPTIONS)
            .await
            .and_then(CacheValue::into_not_found)
            .unwrap_or_default()
    }

    async fn remember_missing(&self, name: &str) {
        let _blob = self.ctx.blob_lock.lock().await;
        let mut not_options = self.not_options().await;
        if not_options.insert(name.to_string()) {
            self.ctx
                .cache
                .set(keys::NOTOPTIONS, CacheValue::NotFound(not_options), groups::OPTIONS)
                .await;
        }
    }

    async fn forget_missing(&self, name: &str) {
        let _blob = self.ctx.blob_lock.lock().await;
        let mut not_options = self.not_options().await;
        if not_options.remove(name) {
            self.ctx
                .cache
                .set(keys::NOTOPTIONS, CacheValue::NotFound(not_options), groups::OPTIONS)
                .await;
        }
    }

    async fn filtered_default(&self, name: &str, ctx: &HookContext, default: Value) -> Value {
        self.ctx
            .hooks
            .apply_filters(&Hook::DefaultOption(name.to_string()), ctx, default)
            .await
    }

    /// What `get` returns for an option that does not exist
    async fn absent_marker(&self, name: &str) -> Value {
        self.filtered_default(name, &HookContext::option(name), Value::Bool(false))
            .await
    }

    async fn sanitize(&self, name: &str, value: Value) -> Value {
        self.ctx
            .hooks
            .apply_filters(
                &Hook::SanitizeOption(name.to_string()),
                &HookContext::option(name),
                value,
            )
            .await
    }

    fn guard(&self, name: &str) -> StoreResult<()> {
        if self.ctx.config.is_protected(name) {
            tracing::warn!(option = %name, "Refusing to modify protected option");
            return Err(StoreError::ProtectedOption(name.to_string()));
        }
        Ok(())
    }
}

/// Map a renamed option to its current name
fn canonical_name(name: &str) -> &str {
    match LEGACY_NAMES.iter().find(|(old, _)| *old == name) {
        Some(&(old, new)) => {
            tracing::warn!(option = %old, replacement = %new, "Option name is deprecated");
            new
        }
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::context::{test_context, test_context_with_cache, YieldingCache};
    use crate::hooks::{priority, HookError};
    use crate::storage::OptionRepo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_autoload_flags() {
        assert!(is_autoloaded("yes"));
        assert!(is_autoloaded("auto-on"));
        assert!(!is_autoloaded("no"));
        assert!(!is_autoloaded("off"));
        assert_eq!(Autoload::from(false).as_str(), "no");
        assert_eq!(Autoload::default(), Autoload::Yes);
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let (ctx, _) = test_context(StoreConfig::default());
        let options = ctx.options();

        assert!(options.add("blogname", "My Site".into(), None).await.unwrap());
        assert_eq!(options.get("blogname", None).await, Value::from("My Site"));

        let nested = Value::map([
            ("a", Value::list([1i64, 2])),
            ("b", Value::from(true)),
        ]);
        assert!(options.add("widget", nested.clone(), None).await.unwrap());
        assert_eq!(options.get("widget", None).await, nested);

        // Already present
        assert!(!options.add("blogname", "Other".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_twice() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("blogname", "Old", "yes").await;
        let options = ctx.options();

        assert!(options.update("blogname", "New".into(), None).await.unwrap());
        assert!(!options.update("blogname", "New".into(), None).await.unwrap());
        assert_eq!(storage.get_option("blogname").await.unwrap(), Some("New".into()));
    }

    #[tokio::test]
    async fn test_update_creates_missing_option() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let options = ctx.options();

        assert!(options.update("fresh", Value::Int(3), None).await.unwrap());
        assert_eq!(storage.option_autoload("fresh").await.unwrap(), Some("yes".into()));
        assert_eq!(options.get("fresh", None).await, Value::from("3"));
    }

    #[tokio::test]
    async fn test_delete_then_default() {
        let (ctx, _) = test_context(StoreConfig::default());
        let options = ctx.options();

        options.add("temp", "x".into(), None).await.unwrap();
        assert!(options.delete("temp").await.unwrap());
        assert!(!options.delete("temp").await.unwrap());
        assert_eq!(
            options.get("temp", Some("fallback".into())).await,
            Value::from("fallback")
        );
        assert_eq!(options.get("temp", None).await, Value::Bool(false));
    }

    #[tokio::test]
    async fn test_missing_option_is_remembered() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let options = ctx.options();

        assert_eq!(options.get("missing_option", None).await, Value::Bool(false));
        let queries = storage.stats().option_queries();

        assert_eq!(options.get("missing_option", None).await, Value::Bool(false));
        assert_eq!(storage.stats().option_queries(), queries);

        // Adding clears the negative entry
        options.add("missing_option", "now".into(), None).await.unwrap();
        assert_eq!(options.get("missing_option", None).await, Value::from("now"));
    }

    #[tokio::test]
    async fn test_protected_options() {
        let mut config = StoreConfig::default();
        config.protected_options.insert("active_plugins".into());
        let (ctx, _) = test_context(config);
        let options = ctx.options();

        assert!(matches!(
            options.update("alloptions", "x".into(), None).await,
            Err(StoreError::ProtectedOption(_))
        ));
        assert!(options.add("notoptions", "x".into(), None).await.is_err());
        assert!(options.delete("active_plugins").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_name() {
        let (ctx, _) = test_context(StoreConfig::default());
        let options = ctx.options();

        assert_eq!(options.get("   ", Some("x".into())).await, Value::Bool(false));
        assert!(!options.add("", "x".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_name_is_remapped() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("disallowed_keys", "spam", "yes").await;

        assert_eq!(
            ctx.options().get("blacklist_keys", None).await,
            Value::from("spam")
        );
    }

    #[tokio::test]
    async fn test_home_and_trailing_slashes() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("siteurl", "https://example.com/", "yes").await;
        storage.seed_option("home", "", "yes").await;
        storage.seed_option("category_base", "/topics/", "yes").await;
        let options = ctx.options();

        assert_eq!(options.get("siteurl", None).await, Value::from("https://example.com"));
        assert_eq!(options.get("home", None).await, Value::from("https://example.com"));
        assert_eq!(options.get("category_base", None).await, Value::from("/topics"));
    }

    #[tokio::test]
    async fn test_autoload_tier_moves() {
        let (ctx, _) = test_context(StoreConfig::default());
        let options = ctx.options();

        options.add("lazy", "x".into(), Some(Autoload::No)).await.unwrap();
        assert_eq!(
            ctx.cache.get("lazy", groups::OPTIONS).await,
            Some(CacheValue::Raw("x".into()))
        );
        assert!(!options.load_autoloaded().await.contains_key("lazy"));

        options.update("lazy", "y".into(), Some(Autoload::Yes)).await.unwrap();
        assert_eq!(ctx.cache.get("lazy", groups::OPTIONS).await, None);
        assert_eq!(
            options.load_autoloaded().await.get("lazy"),
            Some(&"y".to_string())
        );

        options.update("lazy", "z".into(), Some(Autoload::No)).await.unwrap();
        assert!(!options.load_autoloaded().await.contains_key("lazy"));
        assert_eq!(options.get("lazy", None).await, Value::from("z"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_keep_every_blob_entry() {
        let (ctx, storage) = test_context_with_cache(
            StoreConfig::default(),
            Arc::new(YieldingCache::default()),
        );
        storage.seed_option("x", "1", "yes").await;
        storage.seed_option("y", "1", "yes").await;
        let options = ctx.options();

        let (x, y) = tokio::join!(
            options.update("x", "2".into(), None),
            options.update("y", "2".into(), None),
        );
        assert!(x.unwrap());
        assert!(y.unwrap());

        let alloptions = options.load_autoloaded().await;
        assert_eq!(alloptions.get("x"), Some(&"2".to_string()));
        assert_eq!(alloptions.get("y"), Some(&"2".to_string()));
        assert_eq!(options.get("x", None).await, Value::from("2"));
    }

    #[tokio::test]
    async fn test_concurrent_delete_and_add() {
        let (ctx, storage) = test_context_with_cache(
            StoreConfig::default(),
            Arc::new(YieldingCache::default()),
        );
        storage.seed_option("old", "1", "yes").await;
        let options = ctx.options();
        options.get("new", None).await;

        let (deleted, added) = tokio::join!(
            options.delete("old"),
            options.add("new", "v".into(), None),
        );
        assert!(deleted.unwrap());
        assert!(added.unwrap());

        let alloptions = options.load_autoloaded().await;
        assert!(!alloptions.contains_key("old"));
        assert_eq!(alloptions.get("new"), Some(&"v".to_string()));
        assert_eq!(options.get("new", None).await, Value::from("v"));
        assert_eq!(options.get("old", None).await, Value::Bool(false));
    }

    #[tokio::test]
    async fn test_autoloaded_blob_is_shared_between_reads() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("a", "1", "yes").await;
        let options = ctx.options();

        let first = options.load_autoloaded().await;
        options.get("a", None).await;
        let second = options.load_autoloaded().await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_large_values_are_not_autoloaded() {
        let config = StoreConfig {
            max_autoload_size: 8,
            ..StoreConfig::default()
        };
        let (ctx, storage) = test_context(config);
        let options = ctx.options();

        options.add("small", "tiny".into(), None).await.unwrap();
        options.add("large", "a long stored value".into(), None).await.unwrap();

        assert_eq!(storage.option_autoload("small").await.unwrap(), Some("yes".into()));
        assert_eq!(storage.option_autoload("large").await.unwrap(), Some("no".into()));
    }

    #[tokio::test]
    async fn test_serialized_looking_string_round_trips() {
        let (ctx, storage) = test_context(StoreConfig::default());
        let options = ctx.options();
        let tricky = Value::from("a:1:{i:0;s:1:\"x\";}");

        options.add("tricky", tricky.clone(), None).await.unwrap();
        let stored = storage.get_option("tricky").await.unwrap().unwrap();
        assert!(stored.starts_with("s:"));
        assert_eq!(options.get("tricky", None).await, tricky);
    }

    #[tokio::test]
    async fn test_prime_and_get_many() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("a", "1", "no").await;
        storage.seed_option("b", "2", "no").await;
        let options = ctx.options();

        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = options.get_many(&names).await;

        assert_eq!(
            values,
            vec![
                ("a".to_string(), Value::from("1")),
                ("b".to_string(), Value::from("2")),
                ("c".to_string(), Value::Bool(false)),
            ]
        );
        // One autoload query and one batched lookup
        assert_eq!(storage.stats().option_queries(), 2);
    }

    #[tokio::test]
    async fn test_option_hooks() {
        let (ctx, storage) = test_context(StoreConfig::default());
        storage.seed_option("blogname", "Site", "yes").await;
        let hooks = ctx.hooks.clone();

        hooks
            .add_short_circuit(
                Hook::PreOption("forced".into()),
                |_ctx, _v| async move { Ok::<_, HookError>(Some(Value::from("short"))) },
                priority::NORMAL,
            )
            .await;
        hooks
            .add_filter(
                Hook::DefaultOption("absent".into()),
                |_ctx, _v| async move { Ok::<_, HookError>(Value::from("filtered default")) },
                priority::NORMAL,
            )
            .await;
        hooks
            .add_filter(
                Hook::OptionValue("blogname".into()),
                |_ctx, v: Value| async move {
                    Ok::<_, HookError>(Value::String(v.as_str().unwrap_or("").to_uppercase()))
                },
                priority::NORMAL,
            )
            .await;

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        hooks
            .add_action(
                Hook::UpdatedOption,
                move |ctx: HookContext| {
                    let counter = counter.clone();
                    async move {
                        assert_eq!(ctx.old_value, Some(Value::from("SITE")));
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HookError>(())
                    }
                },
                priority::NORMAL,
            )
            .await;

        let options = ctx.options();
        assert_eq!(options.get("forced", None).await, Value::from("short"));
        assert_eq!(options.get("absent", None).await, Value::from("filtered default"));
        assert_eq!(options.get("blogname", None).await, Value::from("SITE"));

        options.update("blogname", "Renamed".into(), None).await.unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sanitize_filter_applies_on_write() {
        let (ctx, storage) = test_context(StoreConfig::default());
        ctx.hooks
            .add_filter(
                Hook::SanitizeOption("posts_per_page".into()),
                |_ctx, v: Value| async move {
                    let n = v.as_int().unwrap_or(10).clamp(1, 100);
                    Ok::<_, HookError>(Value::Int(n))
                },
                priority::NORMAL,
            )
            .await;

        ctx.options()
            .add("posts_per_page", Value::Int(500), None)
            .await
            .unwrap();
        assert_eq!(
            storage.get_option("posts_per_page").await.unwrap(),
            Some("100".into())
        );
    }
}
