//! `system_configs` key/value rows.

use shelfmark_core::{ConfigRepository, EngagementError, Result};
use sqlx::PgPool;
use std::collections::HashMap;

/// `PostgreSQL` backed [`ConfigRepository`].
#[derive(Clone)]
pub struct PostgresConfigRepository {
    pool: PgPool,
}

impl PostgresConfigRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ConfigRepository for PostgresConfigRepository {
    async fn load_all(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT config_key, config_value FROM system_configs")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EngagementError::Database(format!("Failed to load configuration: {e}")))?;
        Ok(rows.into_iter().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config_value FROM system_configs WHERE config_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    EngagementError::Database(format!("Failed to load configuration {key}: {e}"))
                })?;
        Ok(row.map(|(value,)| value))
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO system_configs (config_key, config_value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (config_key) DO UPDATE
            SET config_value = EXCLUDED.config_value, updated_at = now()
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| EngagementError::Database(format!("Failed to store configuration {key}: {e}")))?;

        tracing::info!(key, value, "Configuration updated");
        Ok(())
    }
}
