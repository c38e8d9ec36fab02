//! RustPress Options
//!
//! Option, network option and metadata storage for RustPress providing:
//! - Site options with autoload and a negative lookup cache
//! - Network-wide options for multi-tenant installs
//! - Per-object metadata (posts, terms, comments, users, custom types)
//! - Value serialization compatible with existing databases
//! - Typed hooks for short-circuiting, filtering and observing every operation
//!
//! # Configuration
//!
//! All configuration is loaded from environment variables:
//! - `RUSTPRESS_TABLE_PREFIX` - Table name prefix (default: "wp_")
//! - `RUSTPRESS_MULTISITE` - Enable network options storage (default: false)
//! - `RUSTPRESS_NETWORK_ID` - Current network id (default: 1)
//! - `RUSTPRESS_PROTECTED_OPTIONS` - Extra comma-separated protected option names
//! - `RUSTPRESS_MAX_AUTOLOAD_SIZE` - Largest autoloaded value in bytes (default: 150000)
//!
//! # Usage
//!
//! ```rust,ignore
//! use rustpress_options::{OptionsPlugin, Plugin, Value};
//!
//! let plugin = OptionsPlugin::new();
//! plugin.activate(db_pool).await?;
//!
//! let site = plugin.context().await.unwrap();
//! site.options().update("blogname", Value::from("My Site"), None).await?;
//! let name = site.options().get("blogname", None).await;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod meta;
pub mod meta_types;
pub mod network;
pub mod options;
pub mod serialize;
pub mod storage;
pub mod value;

// Re-export commonly used types
pub use cache::{CacheValue, MemoryCache, ObjectCache};
pub use config::StoreConfig;
pub use context::SiteContext;
pub use error::{StoreError, StoreResult};
pub use hooks::{Hook, HookContext, HookError, HookRegistry};
pub use meta::{MetaEntry, MetaMap, MetaUpdate, MetadataStore};
pub use meta_types::{MetaTypeConfig, MetaTypeRegistry, SubtypeResolver};
pub use network::NetworkOptionStore;
pub use options::{Autoload, OptionStore};
pub use serialize::{is_serialized, maybe_serialize, maybe_unserialize, SniffMode};
pub use storage::{MemoryStorage, PgStorage, Storage};
pub use value::{ArrayKey, Value};

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;

// ============================================
// Plugin Types
// ============================================

/// Plugin state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Inactive,
    Active,
    Error,
}

/// Plugin metadata
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Plugin lifecycle trait
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Get plugin information
    fn info(&self) -> &PluginInfo;

    /// Get current plugin state
    async fn state(&self) -> PluginState;

    /// Activate the plugin
    async fn activate(&self, db: PgPool) -> Result<(), StoreError>;

    /// Deactivate the plugin
    async fn deactivate(&self) -> Result<(), StoreError>;
}

// ============================================
// Options Plugin Implementation
// ============================================

/// RustPress Options Plugin
///
/// Owns the site context. Hooks may be registered before activation; they
/// are carried into every context the plugin builds.
pub struct OptionsPlugin {
    info: PluginInfo,
    state: RwLock<PluginState>,
    hooks: Arc<HookRegistry>,
    context: RwLock<Option<Arc<SiteContext>>>,
}

impl OptionsPlugin {
    /// Create a new options plugin instance
    pub fn new() -> Self {
        Self {
            info: PluginInfo {
                id: "rustpress-options".into(),
                name: "RustPress Options".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                description: "Option, network option and metadata storage for RustPress".into(),
            },
            state: RwLock::new(PluginState::Inactive),
            hooks: Arc::new(HookRegistry::new()),
            context: RwLock::new(None),
        }
    }

    /// Hook registry shared by every context this plugin builds
    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.clone()
    }

    /// Get the active site context
    pub async fn context(&self) -> Option<Arc<SiteContext>> {
        self.context.read().await.clone()
    }

    /// Activate against any storage backend, skipping migrations
    pub async fn activate_with_storage(
        &self,
        config: StoreConfig,
        storage: Arc<dyn Storage>,
        meta_types: MetaTypeRegistry,
    ) -> Result<(), StoreError> {
        if let Err(e) = config.validate() {
            *self.state.write().await = PluginState::Error;
            return Err(e);
        }

        let context = SiteContext::new(config, storage, Arc::new(MemoryCache::new()))
            .with_hooks(self.hooks.clone())
            .with_meta_types(meta_types);

        *self.context.write().await = Some(Arc::new(context));
        *self.state.write().await = PluginState::Active;
        Ok(())
    }
}

impl Default for OptionsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for OptionsPlugin {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    async fn state(&self) -> PluginState {
        *self.state.read().await
    }

    async fn activate(&self, db: PgPool) -> Result<(), StoreError> {
        tracing::info!("Activating RustPress Options plugin");

        // Load configuration from environment
        let config = StoreConfig::from_env();
        if let Err(e) = config.validate() {
            *self.state.write().await = PluginState::Error;
            return Err(e);
        }

        // Posts and terms resolve their subtype from the content tables
        let prefix = config.table_prefix.clone();
        let mut meta_types = MetaTypeRegistry::with_defaults(&prefix);
        meta_types.register(MetaTypeConfig::conventional(
            &prefix,
            "post",
            Arc::new(storage::PgSubtypeResolver::post_types(db.clone(), &prefix)),
        ));
        meta_types.register(MetaTypeConfig::conventional(
            &prefix,
            "term",
            Arc::new(storage::PgSubtypeResolver::taxonomies(db.clone(), &prefix)),
        ));

        // Run migrations
        let storage = PgStorage::new(db, &config);
        if let Err(e) = storage.migrate(&meta_types).await {
            *self.state.write().await = PluginState::Error;
            return Err(e);
        }

        self.activate_with_storage(config, Arc::new(storage), meta_types)
            .await?;

        tracing::info!("RustPress Options plugin activated successfully");
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), StoreError> {
        tracing::info!("Deactivating RustPress Options plugin");

        *self.context.write().await = None;
        *self.state.write().await = PluginState::Inactive;

        tracing::info!("RustPress Options plugin deactivated");
        Ok(())
    }
}

// ============================================
// Module Tests
// ============================================
