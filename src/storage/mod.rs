//! Storage Backends
//!
//! Repository traits for the three backing tables, plus two
//! implementations: PostgreSQL via sqlx and an in-memory store with query
//! counters.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStorage, QueryStats};
pub use postgres::{PgStorage, PgSubtypeResolver};

use crate::error::StoreResult;
use crate::meta_types::MetaTypeConfig;
use crate::options::Autoload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One metadata row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRow {
    pub meta_id: u64,
    pub object_id: u64,
    pub meta_key: String,
    pub meta_value: String,
}

/// Repository for the options table
#[async_trait]
pub trait OptionRepo: Send + Sync {
    /// All autoloaded `(name, raw value)` rows
    async fn load_autoloaded(&self) -> StoreResult<Vec<(String, String)>>;

    /// Raw value of one option
    async fn get_option(&self, name: &str) -> StoreResult<Option<String>>;

    /// Raw values of several options; missing names are omitted
    async fn get_options(&self, names: &[String]) -> StoreResult<Vec<(String, String)>>;

    /// Stored autoload flag, `None` when the row is absent
    async fn option_autoload(&self, name: &str) -> StoreResult<Option<String>>;

    /// Insert, or overwrite on name conflict. Returns whether a row changed.
    async fn upsert_option(&self, name: &str, value: &str, autoload: Autoload) -> StoreResult<bool>;

    /// Update an existing row. `autoload = None` leaves the flag as is.
    async fn update_option(
        &self,
        name: &str,
        value: &str,
        autoload: Option<Autoload>,
    ) -> StoreResult<bool>;

    /// Delete a row. Returns whether one was removed.
    async fn delete_option(&self, name: &str) -> StoreResult<bool>;
}

/// Repository for per-network options
#[async_trait]
pub trait NetworkOptionRepo: Send + Sync {
    async fn get_site_option(&self, network_id: u64, name: &str) -> StoreResult<Option<String>>;

    async fn site_option_exists(&self, network_id: u64, name: &str) -> StoreResult<bool>;

    async fn insert_site_option(&self, network_id: u64, name: &str, value: &str)
        -> StoreResult<bool>;

    async fn update_site_option(&self, network_id: u64, name: &str, value: &str)
        -> StoreResult<bool>;

    async fn delete_site_option(&self, network_id: u64, name: &str) -> StoreResult<bool>;
}

/// Repository for per-object metadata tables
#[async_trait]
pub trait MetaRepo: Send + Sync {
    /// All rows of the given objects, ordered by meta id
    async fn fetch_meta(&self, table: &MetaTypeConfig, object_ids: &[u64])
        -> StoreResult<Vec<MetaRow>>;

    /// Number of rows with this object and key
    async fn count_meta(&self, table: &MetaTypeConfig, object_id: u64, key: &str)
        -> StoreResult<u64>;

    /// Meta ids of rows with this object and key
    async fn meta_ids(&self, table: &MetaTypeConfig, object_id: u64, key: &str)
        -> StoreResult<Vec<u64>>;

    /// Insert a row, returning its meta id
    async fn insert_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<u64>;

    /// Set the value of every row with this object and key, narrowed to
    /// rows currently holding `prev_value` when given. Returns rows changed.
    async fn update_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
        prev_value: Option<&str>,
    ) -> StoreResult<u64>;

    /// `(meta_id, object_id)` of rows with this key, optionally restricted
    /// to one object and/or one value
    async fn find_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: Option<u64>,
        key: &str,
        value: Option<&str>,
    ) -> StoreResult<Vec<(u64, u64)>>;

    /// Delete rows by meta id. Returns rows removed.
    async fn delete_meta_ids(&self, table: &MetaTypeConfig, meta_ids: &[u64]) -> StoreResult<u64>;

    async fn get_meta_by_id(&self, table: &MetaTypeConfig, meta_id: u64)
        -> StoreResult<Option<MetaRow>>;

    async fn update_meta_by_id(
        &self,
        table: &MetaTypeConfig,
        meta_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<bool>;
}

/// Combined storage trait
pub trait Storage: OptionRepo + NetworkOptionRepo + MetaRepo + Send + Sync {}

impl<T: OptionRepo + NetworkOptionRepo + MetaRepo + Send + Sync> Storage for T {}
