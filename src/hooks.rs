//! Hook Registry
//!
//! Typed extension points for the option and metadata stores:
//! - Short-circuits: the first handler returning `Some` replaces the
//!   default implementation
//! - Filters: every handler transforms the value in turn
//! - Actions: side effects after (or before) a write
//!
//! Hooks are keyed by the [`Hook`] enum rather than interpolated strings.

use crate::value::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

// ============================================
// Types
// ============================================

/// Hook execution priority. Higher runs first.
pub mod priority {
    pub const HIGHEST: i32 = 100;
    pub const HIGH: i32 = 50;
    pub const NORMAL: i32 = 0;
    pub const LOW: i32 = -50;
    pub const LOWEST: i32 = -100;
}

/// Hook errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    #[error("Hook failed: {0}")]
    Internal(String),

    #[error("Invalid hook data: {0}")]
    InvalidData(&'static str),
}

/// Extension points
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hook {
    // Options
    PreOption(String),
    PreOptionAny,
    DefaultOption(String),
    OptionValue(String),
    SanitizeOption(String),
    PreUpdateOption(String),
    PreUpdateOptionAny,
    AddOption,
    AddedOption,
    UpdateOption,
    UpdatedOption,
    DeleteOption,
    DeletedOption,

    // Network options
    PreSiteOption(String),
    DefaultSiteOption(String),
    SiteOption(String),
    PreAddSiteOption(String),
    PreUpdateSiteOption(String),
    AddSiteOption,
    UpdateSiteOption,
    DeleteSiteOption,

    // Metadata, keyed by meta type
    GetMetadata(String),
    AddMetadata(String),
    UpdateMetadata(String),
    DeleteMetadata(String),
    DefaultMetadata(String),
    UpdateMetadataCache(String),
    GetMetadataByMid(String),
    UpdateMetadataByMid(String),
    DeleteMetadataByMid(String),
    SanitizeMeta {
        meta_type: String,
        meta_key: String,
        subtype: Option<String>,
    },
    AddMeta(String),
    AddedMeta(String),
    UpdateMeta(String),
    UpdatedMeta(String),
    DeleteMeta(String),
    DeletedMeta(String),
}

/// Arguments handed to every hook callback
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Option name or meta key
    pub name: String,
    pub meta_type: Option<String>,
    pub object_id: Option<u64>,
    pub object_ids: Vec<u64>,
    pub meta_ids: Vec<u64>,
    pub network_id: Option<u64>,
    /// Value being written
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub prev_value: Option<Value>,
    /// Whether the caller supplied a default
    pub passed_default: bool,
    pub single: bool,
    pub unique: bool,
    pub delete_all: bool,
}

impl HookContext {
    /// Context for an option hook
    pub fn option(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Context for a network option hook
    pub fn site_option(name: &str, network_id: u64) -> Self {
        Self {
            name: name.to_string(),
            network_id: Some(network_id),
            ..Default::default()
        }
    }

    /// Context for a metadata hook
    pub fn meta(meta_type: &str, object_id: u64, meta_key: &str) -> Self {
        Self {
            name: meta_key.to_string(),
            meta_type: Some(meta_type.to_string()),
            object_id: Some(object_id),
            ..Default::default()
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, HookError>> + Send>>;

/// Short-circuit handler type
type ShortCircuitFn = Arc<dyn Fn(HookContext, Value) -> BoxFuture<Option<Value>> + Send + Sync>;

/// Filter handler type
type FilterFn = Arc<dyn Fn(HookContext, Value) -> BoxFuture<Value> + Send + Sync>;

/// Action handler type
type ActionFn = Arc<dyn Fn(HookContext) -> BoxFuture<()> + Send + Sync>;

struct Handler<F> {
    callback: F,
    priority: i32,
}

// ============================================
// Hook Registry
// ============================================

/// Registry of short-circuits, filters and actions
pub struct HookRegistry {
    short_circuits: RwLock<HashMap<Hook, Vec<Handler<ShortCircuitFn>>>>,
    filters: RwLock<HashMap<Hook, Vec<Handler<FilterFn>>>>,
    actions: RwLock<HashMap<Hook, Vec<Handler<ActionFn>>>>,
}

fn insert_sorted<F>(handlers: &mut Vec<Handler<F>>, handler: Handler<F>) {
    handlers.push(handler);
    // Stable sort keeps registration order within a priority
    handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
}

fn snapshot<F: Clone>(map: &HashMap<Hook, Vec<Handler<F>>>, hook: &Hook) -> Vec<F> {
    map.get(hook)
        .map(|handlers| handlers.iter().map(|h| h.callback.clone()).collect())
        .unwrap_or_default()
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            short_circuits: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a short-circuit
    pub async fn add_short_circuit<F, Fut>(&self, hook: Hook, callback: F, priority: i32)
    where
        F: Fn(HookContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HookError>> + Send + 'static,
    {
        let mut map = self.short_circuits.write().await;
        insert_sorted(
            map.entry(hook).or_default(),
            Handler {
                callback: Arc::new(move |ctx: HookContext, value: Value| -> BoxFuture<Option<Value>> {
                    Box::pin(callback(ctx, value))
                }),
                priority,
            },
        );
    }

    /// Run short-circuits; the first `Some` wins
    pub async fn short_circuit(&self, hook: &Hook, ctx: &HookContext, value: Value) -> Option<Value> {
        let handlers = snapshot(&*self.short_circuits.read().await, hook);

        for handler in handlers {
            match handler(ctx.clone(), value.clone()).await {
                Ok(Some(result)) => return Some(result),
                Ok(None) => {}
                Err(e) => tracing::warn!(hook = ?hook, "Short-circuit handler failed: {}", e),
            }
        }

        None
    }

    /// Register a filter
    pub async fn add_filter<F, Fut>(&self, hook: Hook, callback: F, priority: i32)
    where
        F: Fn(HookContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HookError>> + Send + 'static,
    {
        let mut map = self.filters.write().await;
        insert_sorted(
            map.entry(hook).or_default(),
            Handler {
                callback: Arc::new(move |ctx: HookContext, value: Value| -> BoxFuture<Value> {
                    Box::pin(callback(ctx, value))
                }),
                priority,
            },
        );
    }

    /// Apply filters in priority order
    pub async fn apply_filters(&self, hook: &Hook, ctx: &HookContext, value: Value) -> Value {
        let handlers = snapshot(&*self.filters.read().await, hook);
        let mut result = value;

        for handler in handlers {
            match handler(ctx.clone(), result.clone()).await {
                Ok(next) => result = next,
                Err(e) => tracing::warn!(hook = ?hook, "Filter handler failed: {}", e),
            }
        }

        result
    }

    /// Whether any filter is registered for `hook`
    pub async fn has_filter(&self, hook: &Hook) -> bool {
        self.filters
            .read()
            .await
            .get(hook)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Register an action
    pub async fn add_action<F, Fut>(&self, hook: Hook, callback: F, priority: i32)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let mut map = self.actions.write().await;
        insert_sorted(
            map.entry(hook).or_default(),
            Handler {
                callback: Arc::new(move |ctx: HookContext| -> BoxFuture<()> { Box::pin(callback(ctx)) }),
                priority,
            },
        );
    }

    /// Execute an action
    pub async fn do_action(&self, hook: &Hook, ctx: &HookContext) {
        let handlers = snapshot(&*self.actions.read().await, hook);

        for handler in handlers {
            if let Err(e) = handler(ctx.clone()).await {
                tracing::warn!(hook = ?hook, "Action handler failed: {}", e);
            }
        }
    }

    /// Remove every handler registered for `hook`
    pub async fn remove_all(&self, hook: &Hook) {
        self.short_circuits.write().await.remove(hook);
        self.filters.write().await.remove(hook);
        self.actions.write().await.remove(hook);
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
