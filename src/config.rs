//! Store Configuration
//!
//! All configuration values are loaded from environment variables.
//! Every value has a default, so loading never fails; call `validate()`
//! before building a context.

use crate::error::StoreError;
use std::collections::HashSet;
use std::env;

/// Names that can never be written through the option API
pub const ALWAYS_PROTECTED: [&str; 2] = ["alloptions", "notoptions"];

/// Options and metadata configuration loaded from environment
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Table name prefix (from RUSTPRESS_TABLE_PREFIX env var)
    pub table_prefix: String,

    /// Multi-tenancy enabled (from RUSTPRESS_MULTISITE env var)
    pub multisite: bool,

    /// Network used when callers pass none (from RUSTPRESS_NETWORK_ID env var)
    pub current_network_id: u64,

    /// Additional protected option names (from RUSTPRESS_PROTECTED_OPTIONS env var)
    pub protected_options: HashSet<String>,

    /// Largest serialized value autoloaded by default, in bytes
    /// (from RUSTPRESS_MAX_AUTOLOAD_SIZE env var)
    pub max_autoload_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: "wp_".to_string(),
            multisite: false,
            current_network_id: 1,
            protected_options: HashSet::new(),
            max_autoload_size: 150_000,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            table_prefix: env::var("RUSTPRESS_TABLE_PREFIX").unwrap_or(defaults.table_prefix),

            multisite: env::var("RUSTPRESS_MULTISITE")
                .ok()
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.multisite),

            current_network_id: env::var("RUSTPRESS_NETWORK_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.current_network_id),

            protected_options: env::var("RUSTPRESS_PROTECTED_OPTIONS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),

            max_autoload_size: env::var("RUSTPRESS_MAX_AUTOLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_autoload_size),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.table_prefix.is_empty()
            || !self
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Config(
                "RUSTPRESS_TABLE_PREFIX may only contain letters, digits and underscores"
                    .to_string(),
            ));
        }

        if self.current_network_id == 0 {
            return Err(StoreError::Config(
                "RUSTPRESS_NETWORK_ID must be positive".to_string(),
            ));
        }

        if self.max_autoload_size == 0 {
            return Err(StoreError::Config(
                "RUSTPRESS_MAX_AUTOLOAD_SIZE must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether `name` is protected from add/update/delete
    pub fn is_protected(&self, name: &str) -> bool {
        ALWAYS_PROTECTED.contains(&name) || self.protected_options.contains(name)
    }

    /// `{prefix}options`
    pub fn options_table(&self) -> String {
        format!("{}options", self.table_prefix)
    }

    /// `{prefix}sitemeta`
    pub fn sitemeta_table(&self) -> String {
        format!("{}sitemeta", self.table_prefix)
    }
}
