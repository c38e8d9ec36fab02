//! Network Option Store
//!
//! Options shared by every site of a network. With multi-tenancy off these
//! are plain options stored without autoload.

use crate::cache::{groups, CacheValue};
use crate::context::SiteContext;
use crate::error::{StoreError, StoreResult};
use crate::hooks::{Hook, HookContext};
use crate::options::Autoload;
use crate::serialize::{maybe_serialize, maybe_unserialize_str, to_storage};
use crate::storage::NetworkOptionRepo;
use crate::value::Value;
use std::collections::HashSet;

/// Network option operations over a [`SiteContext`]
#[derive(Clone, Copy)]
pub struct NetworkOptionStore<'a> {
    ctx: &'a SiteContext,
}

fn value_key(network_id: u64, name: &str) -> String {
    format!("{}:{}", network_id, name)
}

fn not_options_key(network_id: u64) -> String {
    format!("{}:notoptions", network_id)
}

impl<'a> NetworkOptionStore<'a> {
    pub fn new(ctx: &'a SiteContext) -> Self {
        Self { ctx }
    }

    /// `None` and `0` select the configured network
    fn network(&self, network_id: Option<u64>) -> u64 {
        match network_id {
            Some(id) if id > 0 => id,
            _ => self.ctx.config.current_network_id,
        }
    }

    fn multisite(&self) -> bool {
        self.ctx.config.multisite
    }

    /// Get a network option
    pub async fn get(&self, network_id: Option<u64>, name: &str, default: Option<Value>) -> Value {
        let name = name.trim();
        if name.is_empty() {
            return Value::Bool(false);
        }
        let network_id = self.network(network_id);

        let hooks = &self.ctx.hooks;
        let ctx = HookContext {
            passed_default: default.is_some(),
            ..HookContext::site_option(name, network_id)
        };
        let default = default.unwrap_or(Value::Bool(false));

        if let Some(value) = hooks
            .short_circuit(&Hook::PreSiteOption(name.to_string()), &ctx, default.clone())
            .await
        {
            return value;
        }

        if self.not_options(network_id).await.contains(name) {
            return self.filtered_default(name, &ctx, default).await;
        }

        let value = if !self.multisite() {
            let default = self.filtered_default(name, &ctx, default).await;
            self.ctx.options().get(name, Some(default)).await
        } else {
            let key = value_key(network_id, name);
            match self
                .ctx
                .cache
                .get(&key, groups::SITE_OPTIONS)
                .await
                .and_then(CacheValue::into_value)
            {
                Some(value) => value,
                None => match self.ctx.storage.get_site_option(network_id, name).await {
                    Ok(Some(raw)) => {
                        let value = maybe_unserialize_str(&raw);
                        self.ctx
                            .cache
                            .set(&key, CacheValue::Value(value.clone()), groups::SITE_OPTIONS)
                            .await;
                        value
                    }
                    Ok(None) => {
                        self.remember_missing(network_id, name).await;
                        self.filtered_default(name, &ctx, default).await
                    }
                    Err(e) => {
                        tracing::warn!(option = %name, network_id, "Network option lookup failed: {}", e);
                        self.filtered_default(name, &ctx, default).await
                    }
                },
            }
        };

        hooks
            .apply_filters(&Hook::SiteOption(name.to_string()), &ctx, value)
            .await
    }

    /// Add a network option. Returns `Ok(false)` when it already exists.
    pub async fn add(&self, network_id: Option<u64>, name: &str, value: Value) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let network_id = self.network(network_id);
        self.guard(name)?;

        let hooks = &self.ctx.hooks;
        let mut ctx = HookContext::site_option(name, network_id);
        let value = hooks
            .apply_filters(&Hook::PreAddSiteOption(name.to_string()), &ctx, value)
            .await;

        let added = if !self.multisite() {
            self.ctx
                .options()
                .add(name, value.clone(), Some(Autoload::No))
                .await?
        } else {
            self.insert_row(network_id, name, &value).await
        };

        if added {
            ctx.value = Some(value);
            hooks.do_action(&Hook::AddSiteOption, &ctx).await;
        }
        Ok(added)
    }

    /// Update a network option, creating it when absent
    pub async fn update(&self, network_id: Option<u64>, name: &str, value: Value) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let network_id = self.network(network_id);
        self.guard(name)?;

        let hooks = &self.ctx.hooks;
        let old_value = self.get(Some(network_id), name, None).await;
        let mut ctx = HookContext {
            old_value: Some(old_value.clone()),
            ..HookContext::site_option(name, network_id)
        };
        let value = hooks
            .apply_filters(&Hook::PreUpdateSiteOption(name.to_string()), &ctx, value)
            .await;

        if value == old_value || maybe_serialize(&value) == maybe_serialize(&old_value) {
            return Ok(false);
        }

        if old_value == self.absent_marker(name, network_id).await {
            return self.add(Some(network_id), name, value).await;
        }

        let updated = if !self.multisite() {
            self.ctx
                .options()
                .update(name, value.clone(), Some(Autoload::No))
                .await?
        } else {
            self.update_row(network_id, name, &value).await
        };

        if updated {
            ctx.value = Some(value);
            hooks.do_action(&Hook::UpdateSiteOption, &ctx).await;
        }
        Ok(updated)
    }

    /// Delete a network option. Returns `Ok(false)` when it does not exist.
    pub async fn delete(&self, network_id: Option<u64>, name: &str) -> StoreResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let network_id = self.network(network_id);
        self.guard(name)?;

        let removed = if !self.multisite() {
            self.ctx.options().delete(name).await?
        } else {
            match self.ctx.storage.site_option_exists(network_id, name).await {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    tracing::warn!(option = %name, network_id, "Failed to read network option: {}", e);
                    return Ok(false);
                }
            }

            self.ctx
                .cache
                .delete(&value_key(network_id, name), groups::SITE_OPTIONS)
                .await;

            match self.ctx.storage.delete_site_option(network_id, name).await {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::warn!(option = %name, network_id, "Failed to delete network option: {}", e);
                    false
                }
            }
        };

        if removed {
            self.ctx
                .hooks
                .do_action(&Hook::DeleteSiteOption, &HookContext::site_option(name, network_id))
                .await;
        }
        Ok(removed)
    }

    /// Insert a row, then cache it. Storage failures count as not added.
    async fn insert_row(&self, network_id: u64, name: &str, value: &Value) -> bool {
        if !self.not_options(network_id).await.contains(name)
            && self.get(Some(network_id), name, None).await != self.absent_marker(name, network_id).await
        {
            return false;
        }

        match self
            .ctx
            .storage
            .insert_site_option(network_id, name, &to_storage(value))
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(option = %name, network_id, "Failed to add network option: {}", e);
                return false;
            }
        }

        self.cache_value(network_id, name, value).await;
        true
    }

    async fn update_row(&self, network_id: u64, name: &str, value: &Value) -> bool {
        match self
            .ctx
            .storage
            .update_site_option(network_id, name, &to_storage(value))
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(option = %name, network_id, "Failed to update network option: {}", e);
                return false;
            }
        }

        self.cache_value(network_id, name, value).await;
        true
    }

    async fn cache_value(&self, network_id: u64, name: &str, value: &Value) {
        self.ctx
            .cache
            .set(
                &value_key(network_id, name),
                CacheValue::Value(value.clone()),
                groups::SITE_OPTIONS,
            )
            .await;
        self.forget_missing(network_id, name).await;
    }

    async fn remember_missing(&self, network_id: u64, name: &str) {
        let _blob = self.ctx.blob_lock.lock().await;
        let mut not_options = self.not_options(network_id).await;
        if not_options.insert(name.to_string()) {
            self.ctx
                .cache
                .set(
                    &not_options_key(network_id),
                    CacheValue::NotFound(not_options),
                    groups::SITE_OPTIONS,
                )
                .await;
        }
    }

    async fn forget_missing(&self, network_id: u64, name: &str) {
        let _blob = self.ctx.blob_lock.lock().await;
        let mut not_options = self.not_options(network_id).await;
        if not_options.remove(name) {
            self.ctx
                .cache
                .set(
                    &not_options_key(network_id),
                    CacheValue::NotFound(not_options),
                    groups::SITE_OPTIONS,
                )
                .await;
        }
    }

    async fn not_options(&self, network_id: u64) -> HashSet<String> {
        self.ctx
            .cache
            .get(&not_options_key(network_id), groups::SITE_OPTIONS)
            .await
            .and_then(CacheValue::into_not_found)
            .unwrap_or_default()
    }

    async fn filtered_default(&self, name: &str, ctx: &HookContext, default: Value) -> Value {
        self.ctx
            .hooks
            .apply_filters(&Hook::DefaultSiteOption(name.to_string()), ctx, default)
            .await
    }

    async fn absent_marker(&self, name: &str, network_id: u64) -> Value {
        self.filtered_default(
            name,
            &HookContext::site_option(name, network_id),
            Value::Bool(false),
        )
        .await
    }

    fn guard(&self, name: &str) -> StoreResult<()> {
        if self.ctx.config.is_protected(name) {
            tracing::warn!(option = %name, "Refusing to modify protected network option");
            return Err(StoreError::ProtectedOption(name.to_string()));
        }
        Ok(())
    }
}
