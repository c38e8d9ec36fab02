//! Meta Types
//!
//! Each object kind that carries metadata (posts, terms, comments, users,
//! or anything registered later) maps to a backing table through a
//! [`MetaTypeConfig`]. The config is looked up once per store call.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves an object's subtype (post type, taxonomy, ...). Only used to
/// pick the sanitize hook for a meta key.
#[async_trait]
pub trait SubtypeResolver: Send + Sync {
    async fn object_subtype(&self, object_id: u64) -> Option<String>;
}

/// Every object of the type has the same subtype
pub struct FixedSubtype(pub String);

#[async_trait]
impl SubtypeResolver for FixedSubtype {
    async fn object_subtype(&self, _object_id: u64) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Objects of the type have no subtype
pub struct NoSubtype;

#[async_trait]
impl SubtypeResolver for NoSubtype {
    async fn object_subtype(&self, _object_id: u64) -> Option<String> {
        None
    }
}

/// Subtypes from a fixed lookup table
#[derive(Default)]
pub struct StaticSubtypes(pub HashMap<u64, String>);

#[async_trait]
impl SubtypeResolver for StaticSubtypes {
    async fn object_subtype(&self, object_id: u64) -> Option<String> {
        self.0.get(&object_id).cloned()
    }
}

/// Backing table description of a meta type
#[derive(Clone)]
pub struct MetaTypeConfig {
    pub meta_type: String,
    /// e.g. `wp_postmeta`
    pub table_name: String,
    /// e.g. `post_id`
    pub object_column: String,
    /// `meta_id`, or `umeta_id` for users
    pub id_column: String,
    pub subtype: Arc<dyn SubtypeResolver>,
}

impl MetaTypeConfig {
    /// Conventional layout: `{prefix}{type}meta`, `{type}_id`, `meta_id`
    pub fn conventional(prefix: &str, meta_type: &str, subtype: Arc<dyn SubtypeResolver>) -> Self {
        let id_column = if meta_type == "user" { "umeta_id" } else { "meta_id" };
        Self {
            meta_type: meta_type.to_string(),
            table_name: format!("{}{}meta", prefix, meta_type),
            object_column: format!("{}_id", meta_type),
            id_column: id_column.to_string(),
            subtype,
        }
    }

    pub async fn object_subtype(&self, object_id: u64) -> Option<String> {
        self.subtype
            .object_subtype(object_id)
            .await
            .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for MetaTypeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTypeConfig")
            .field("meta_type", &self.meta_type)
            .field("table_name", &self.table_name)
            .field("object_column", &self.object_column)
            .field("id_column", &self.id_column)
            .finish()
    }
}

/// Known meta types
#[derive(Debug, Clone, Default)]
pub struct MetaTypeRegistry {
    types: HashMap<String, MetaTypeConfig>,
}

impl MetaTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `post`, `term`, `comment` and `user`. Posts and terms
    /// get no subtype; replace them with [`register`](Self::register) to
    /// resolve post types or taxonomies.
    pub fn with_defaults(prefix: &str) -> Self {
        let mut registry = Self::new();
        registry.register(MetaTypeConfig::conventional(prefix, "post", Arc::new(NoSubtype)));
        registry.register(MetaTypeConfig::conventional(prefix, "term", Arc::new(NoSubtype)));
        registry.register(MetaTypeConfig::conventional(
            prefix,
            "comment",
            Arc::new(FixedSubtype("comment".into())),
        ));
        registry.register(MetaTypeConfig::conventional(
            prefix,
            "user",
            Arc::new(FixedSubtype("user".into())),
        ));
        registry
    }

    /// Add or replace a meta type
    pub fn register(&mut self, config: MetaTypeConfig) {
        self.types.insert(config.meta_type.clone(), config);
    }

    pub fn get(&self, meta_type: &str) -> Option<&MetaTypeConfig> {
        self.types.get(meta_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaTypeConfig> {
        self.types.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let registry = MetaTypeRegistry::with_defaults("wp_");

        let post = registry.get("post").unwrap();
        assert_eq!(post.table_name, "wp_postmeta");
        assert_eq!(post.object_column, "post_id");
        assert_eq!(post.id_column, "meta_id");

        let user = registry.get("user").unwrap();
        assert_eq!(user.table_name, "wp_usermeta");
        assert_eq!(user.id_column, "umeta_id");

        assert!(registry.get("widget").is_none());
    }

    #[tokio::test]
    async fn test_subtypes() {
        let mut registry = MetaTypeRegistry::with_defaults("wp_");
        assert_eq!(
            registry.get("comment").unwrap().object_subtype(5).await,
            Some("comment".to_string())
        );
        assert_eq!(registry.get("post").unwrap().object_subtype(5).await, None);

        let mut posts = HashMap::new();
        posts.insert(5, "product".to_string());
        registry.register(MetaTypeConfig::conventional(
            "wp_",
            "post",
            Arc::new(StaticSubtypes(posts)),
        ));
        assert_eq!(
            registry.get("post").unwrap().object_subtype(5).await,
            Some("product".to_string())
        );
    }
}
