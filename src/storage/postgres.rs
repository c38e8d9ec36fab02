//! PostgreSQL Storage
//!
//! sqlx backend. Values are always bound as parameters; table and column
//! names come from validated configuration only.

use super::{MetaRepo, MetaRow, NetworkOptionRepo, OptionRepo};
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::meta_types::{MetaTypeConfig, MetaTypeRegistry, SubtypeResolver};
use crate::options::{Autoload, AUTOLOAD_VALUES};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
struct PgMetaRow {
    meta_id: i64,
    object_id: i64,
    meta_key: String,
    meta_value: String,
}

impl From<PgMetaRow> for MetaRow {
    fn from(row: PgMetaRow) -> Self {
        MetaRow {
            meta_id: row.meta_id as u64,
            object_id: row.object_id as u64,
            meta_key: row.meta_key,
            meta_value: row.meta_value,
        }
    }
}

fn ids(values: &[u64]) -> Vec<i64> {
    values.iter().map(|v| *v as i64).collect()
}

/// PostgreSQL backend
pub struct PgStorage {
    db: PgPool,
    options_table: String,
    sitemeta_table: String,
}

impl PgStorage {
    /// Create a new backend over an existing pool
    pub fn new(db: PgPool, config: &StoreConfig) -> Self {
        Self {
            db,
            options_table: config.options_table(),
            sitemeta_table: config.sitemeta_table(),
        }
    }

    /// Get reference to the database pool
    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Create the options, sitemeta and meta tables
    pub async fn migrate(&self, meta_types: &MetaTypeRegistry) -> StoreResult<()> {
        tracing::info!("Running options database migrations");

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                option_id BIGSERIAL PRIMARY KEY,
                option_name VARCHAR(191) NOT NULL UNIQUE,
                option_value TEXT NOT NULL DEFAULT '',
                autoload VARCHAR(20) NOT NULL DEFAULT 'yes'
            );
            "#,
            table = self.options_table
        ))
        .execute(&self.db)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_autoload ON {table}(autoload);",
            table = self.options_table
        ))
        .execute(&self.db)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                meta_id BIGSERIAL PRIMARY KEY,
                site_id BIGINT NOT NULL DEFAULT 0,
                meta_key VARCHAR(255),
                meta_value TEXT
            );
            "#,
            table = self.sitemeta_table
        ))
        .execute(&self.db)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_site_key ON {table}(site_id, meta_key);",
            table = self.sitemeta_table
        ))
        .execute(&self.db)
        .await?;

        for config in meta_types.iter() {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    {id} BIGSERIAL PRIMARY KEY,
                    {object} BIGINT NOT NULL DEFAULT 0,
                    meta_key VARCHAR(255),
                    meta_value TEXT
                );
                "#,
                table = config.table_name,
                id = config.id_column,
                object = config.object_column
            ))
            .execute(&self.db)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_object ON {table}({object});",
                table = config.table_name,
                object = config.object_column
            ))
            .execute(&self.db)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table}(meta_key);",
                table = config.table_name
            ))
            .execute(&self.db)
            .await?;
        }

        tracing::info!("Options migrations completed successfully");
        Ok(())
    }
}

/// Resolves object subtypes with a single-column lookup
pub struct PgSubtypeResolver {
    db: PgPool,
    sql: String,
}

impl PgSubtypeResolver {
    /// `post_type` of `{prefix}posts`
    pub fn post_types(db: PgPool, prefix: &str) -> Self {
        Self {
            db,
            sql: format!("SELECT post_type FROM {}posts WHERE id = $1", prefix),
        }
    }

    /// `taxonomy` of `{prefix}term_taxonomy`
    pub fn taxonomies(db: PgPool, prefix: &str) -> Self {
        Self {
            db,
            sql: format!(
                "SELECT taxonomy FROM {}term_taxonomy WHERE term_id = $1 LIMIT 1",
                prefix
            ),
        }
    }
}

#[async_trait]
impl SubtypeResolver for PgSubtypeResolver {
    async fn object_subtype(&self, object_id: u64) -> Option<String> {
        match sqlx::query_scalar::<_, String>(&self.sql)
            .bind(object_id as i64)
            .fetch_optional(&self.db)
            .await
        {
            Ok(subtype) => subtype,
            Err(e) => {
                tracing::debug!(object_id, "Subtype lookup failed: {}", e);
                None
            }
        }
    }
}

/// `SELECT` list mapping a meta table onto [`PgMetaRow`]
fn meta_columns(table: &MetaTypeConfig) -> String {
    format!(
        "{id} AS meta_id, {object} AS object_id, COALESCE(meta_key, '') AS meta_key, COALESCE(meta_value, '') AS meta_value",
        id = table.id_column,
        object = table.object_column
    )
}

#[async_trait]
impl OptionRepo for PgStorage {
    async fn load_autoloaded(&self) -> StoreResult<Vec<(String, String)>> {
        let autoload: Vec<String> = AUTOLOAD_VALUES.iter().map(|s| s.to_string()).collect();
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT option_name, option_value FROM {} WHERE autoload = ANY($1)",
            self.options_table
        ))
        .bind(&autoload)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn get_option(&self, name: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar(&format!(
            "SELECT option_value FROM {} WHERE option_name = $1 LIMIT 1",
            self.options_table
        ))
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(value)
    }

    async fn get_options(&self, names: &[String]) -> StoreResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT option_name, option_value FROM {} WHERE option_name = ANY($1)",
            self.options_table
        ))
        .bind(names)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn option_autoload(&self, name: &str) -> StoreResult<Option<String>> {
        let autoload = sqlx::query_scalar(&format!(
            "SELECT autoload FROM {} WHERE option_name = $1",
            self.options_table
        ))
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(autoload)
    }

    async fn upsert_option(&self, name: &str, value: &str, autoload: Autoload) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (option_name, option_value, autoload)
            VALUES ($1, $2, $3)
            ON CONFLICT (option_name)
            DO UPDATE SET option_value = EXCLUDED.option_value, autoload = EXCLUDED.autoload
            "#,
            self.options_table
        ))
        .bind(name)
        .bind(value)
        .bind(autoload.as_str())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_option(
        &self,
        name: &str,
        value: &str,
        autoload: Option<Autoload>,
    ) -> StoreResult<bool> {
        let result = match autoload {
            Some(autoload) => {
                sqlx::query(&format!(
                    "UPDATE {} SET option_value = $1, autoload = $2 WHERE option_name = $3",
                    self.options_table
                ))
                .bind(value)
                .bind(autoload.as_str())
                .bind(name)
                .execute(&self.db)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "UPDATE {} SET option_value = $1 WHERE option_name = $2",
                    self.options_table
                ))
                .bind(value)
                .bind(name)
                .execute(&self.db)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn delete_option(&self, name: &str) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE option_name = $1",
            self.options_table
        ))
        .bind(name)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl NetworkOptionRepo for PgStorage {
    async fn get_site_option(&self, network_id: u64, name: &str) -> StoreResult<Option<String>> {
        let value: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT meta_value FROM {} WHERE meta_key = $1 AND site_id = $2 LIMIT 1",
            self.sitemeta_table
        ))
        .bind(name)
        .bind(network_id as i64)
        .fetch_optional(&self.db)
        .await?;

        Ok(value.map(Option::unwrap_or_default))
    }

    async fn site_option_exists(&self, network_id: u64, name: &str) -> StoreResult<bool> {
        let meta_id: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT meta_id FROM {} WHERE meta_key = $1 AND site_id = $2 LIMIT 1",
            self.sitemeta_table
        ))
        .bind(name)
        .bind(network_id as i64)
        .fetch_optional(&self.db)
        .await?;

        Ok(meta_id.is_some())
    }

    async fn insert_site_option(
        &self,
        network_id: u64,
        name: &str,
        value: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (site_id, meta_key, meta_value) VALUES ($1, $2, $3)",
            self.sitemeta_table
        ))
        .bind(network_id as i64)
        .bind(name)
        .bind(value)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_site_option(
        &self,
        network_id: u64,
        name: &str,
        value: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET meta_value = $1 WHERE site_id = $2 AND meta_key = $3",
            self.sitemeta_table
        ))
        .bind(value)
        .bind(network_id as i64)
        .bind(name)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_site_option(&self, network_id: u64, name: &str) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE meta_key = $1 AND site_id = $2",
            self.sitemeta_table
        ))
        .bind(name)
        .bind(network_id as i64)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MetaRepo for PgStorage {
    async fn fetch_meta(
        &self,
        table: &MetaTypeConfig,
        object_ids: &[u64],
    ) -> StoreResult<Vec<MetaRow>> {
        let rows: Vec<PgMetaRow> = sqlx::query_as(&format!(
            "SELECT {columns} FROM {table} WHERE {object} = ANY($1) ORDER BY {id} ASC",
            columns = meta_columns(table),
            table = table.table_name,
            object = table.object_column,
            id = table.id_column
        ))
        .bind(ids(object_ids))
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(MetaRow::from).collect())
    }

    async fn count_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE meta_key = $1 AND {object} = $2",
            table = table.table_name,
            object = table.object_column
        ))
        .bind(key)
        .bind(object_id as i64)
        .fetch_one(&self.db)
        .await?;

        Ok(count as u64)
    }

    async fn meta_ids(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
    ) -> StoreResult<Vec<u64>> {
        let found: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT {id} FROM {table} WHERE meta_key = $1 AND {object} = $2 ORDER BY {id} ASC",
            id = table.id_column,
            table = table.table_name,
            object = table.object_column
        ))
        .bind(key)
        .bind(object_id as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(found.into_iter().map(|id| id as u64).collect())
    }

    async fn insert_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<u64> {
        let meta_id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {table} ({object}, meta_key, meta_value) VALUES ($1, $2, $3) RETURNING {id}",
            table = table.table_name,
            object = table.object_column,
            id = table.id_column
        ))
        .bind(object_id as i64)
        .bind(key)
        .bind(value)
        .fetch_one(&self.db)
        .await?;

        Ok(meta_id as u64)
    }

    async fn update_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: u64,
        key: &str,
        value: &str,
        prev_value: Option<&str>,
    ) -> StoreResult<u64> {
        let result = match prev_value {
            Some(prev) => {
                sqlx::query(&format!(
                    "UPDATE {table} SET meta_value = $1 WHERE {object} = $2 AND meta_key = $3 AND meta_value = $4",
                    table = table.table_name,
                    object = table.object_column
                ))
                .bind(value)
                .bind(object_id as i64)
                .bind(key)
                .bind(prev)
                .execute(&self.db)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "UPDATE {table} SET meta_value = $1 WHERE {object} = $2 AND meta_key = $3",
                    table = table.table_name,
                    object = table.object_column
                ))
                .bind(value)
                .bind(object_id as i64)
                .bind(key)
                .execute(&self.db)
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn find_meta(
        &self,
        table: &MetaTypeConfig,
        object_id: Option<u64>,
        key: &str,
        value: Option<&str>,
    ) -> StoreResult<Vec<(u64, u64)>> {
        let mut sql = format!(
            "SELECT {id}, {object} FROM {table} WHERE meta_key = $1",
            id = table.id_column,
            object = table.object_column,
            table = table.table_name
        );
        let mut next = 2;
        if object_id.is_some() {
            sql.push_str(&format!(" AND {} = ${}", table.object_column, next));
            next += 1;
        }
        if value.is_some() {
            sql.push_str(&format!(" AND meta_value = ${}", next));
        }
        sql.push_str(&format!(" ORDER BY {} ASC", table.id_column));

        let mut query = sqlx::query_as::<_, (i64, i64)>(&sql).bind(key);
        if let Some(id) = object_id {
            query = query.bind(id as i64);
        }
        if let Some(v) = value {
            query = query.bind(v);
        }

        let rows = query.fetch_all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|(meta_id, object_id)| (meta_id as u64, object_id as u64))
            .collect())
    }

    async fn delete_meta_ids(&self, table: &MetaTypeConfig, meta_ids: &[u64]) -> StoreResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE {id} = ANY($1)",
            table = table.table_name,
            id = table.id_column
        ))
        .bind(ids(meta_ids))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_meta_by_id(
        &self,
        table: &MetaTypeConfig,
        meta_id: u64,
    ) -> StoreResult<Option<MetaRow>> {
        let row: Option<PgMetaRow> = sqlx::query_as(&format!(
            "SELECT {columns} FROM {table} WHERE {id} = $1",
            columns = meta_columns(table),
            table = table.table_name,
            id = table.id_column
        ))
        .bind(meta_id as i64)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(MetaRow::from))
    }

    async fn update_meta_by_id(
        &self,
        table: &MetaTypeConfig,
        meta_id: u64,
        key: &str,
        value: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {table} SET meta_key = $1, meta_value = $2 WHERE {id} = $3",
            table = table.table_name,
            id = table.id_column
        ))
        .bind(key)
        .bind(value)
        .bind(meta_id as i64)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_columns() {
        let registry = MetaTypeRegistry::with_defaults("wp_");
        assert_eq!(
            meta_columns(registry.get("user").unwrap()),
            "umeta_id AS meta_id, user_id AS object_id, COALESCE(meta_key, '') AS meta_key, COALESCE(meta_value, '') AS meta_value"
        );
    }

    #[test]
    fn test_id_conversion() {
        assert_eq!(ids(&[1, 2, 3]), vec![1i64, 2, 3]);
    }
}
