//! Read-through cache over the `system_configs` table.

use shelfmark_core::{ConfigRepository, EngagementConfig, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Keys under which engagement settings can be overridden at runtime.
pub mod keys {
    /// Events per pipeline batch
    pub const BATCH_SIZE: &str = "engagement.batch_size";
    /// Workers per engagement kind
    pub const WORKERS_PER_KIND: &str = "engagement.workers_per_kind";
    /// Seconds before an unacknowledged entry is reclaimed
    pub const PENDING_TIMEOUT_SECS: &str = "engagement.pending_timeout_secs";
    /// Seconds between scheduled leaderboard rebuilds
    pub const REBUILD_INTERVAL_SECS: &str = "engagement.rebuild_interval_secs";
}

/// Configuration values cached in memory.
///
/// Lookups that miss the cache fall through to the repository; a failed
/// lookup or an unparsable value yields the caller's default.
pub struct ConfigCache<R> {
    repo: Arc<R>,
    values: RwLock<HashMap<String, String>>,
}

impl<R: ConfigRepository> ConfigCache<R> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache with every stored row.
    ///
    /// # Returns
    ///
    /// Number of rows loaded.
    ///
    /// # Errors
    ///
    /// Returns error if the repository cannot be read; the cache is left as is.
    pub async fn refresh(&self) -> Result<usize> {
        let rows = self.repo.load_all().await?;
        let count = rows.len();
        *self.values.write().await = rows;
        info!(count, "Configuration cache refreshed");
        Ok(count)
    }

    /// Raw value of `key`, or `default`.
    pub async fn get(&self, key: &str, default: &str) -> String {
        if let Some(value) = self.values.read().await.get(key) {
            return value.clone();
        }
        match self.repo.get(key).await {
            Ok(Some(value)) => {
                self.values
                    .write()
                    .await
                    .insert(key.to_string(), value.clone());
                value
            }
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!(key, error = %e, "Failed to read configuration, using default");
                default.to_string()
            }
        }
    }

    /// Value of `key` parsed as `T`, or `default`.
    pub async fn get_parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + ToString,
    {
        let raw = self.get(key, &default.to_string()).await;
        raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Unparsable configuration value, using default");
            default
        })
    }

    /// Integer value of `key`, or `default`.
    pub async fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_parsed(key, default).await
    }

    /// Float value of `key`, or `default`.
    pub async fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get_parsed(key, default).await
    }

    /// Boolean value of `key`, or `default`.
    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_parsed(key, default).await
    }

    /// Store a value and update the cache.
    ///
    /// # Errors
    ///
    /// Returns error if the repository write fails; the cache is not changed.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.repo.upsert(key, value).await?;
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// `base` with any stored engagement overrides applied.
    pub async fn engagement_config(&self, base: EngagementConfig) -> EngagementConfig {
        let batch_size = self.get_parsed(keys::BATCH_SIZE, base.batch_size).await;
        let workers = self
            .get_parsed(keys::WORKERS_PER_KIND, base.workers_per_kind)
            .await;
        let pending = self
            .get_parsed(keys::PENDING_TIMEOUT_SECS, base.pending_timeout.as_secs())
            .await;
        let rebuild = self
            .get_parsed(keys::REBUILD_INTERVAL_SECS, base.rebuild_interval.as_secs())
            .await;

        base.with_batch_size(batch_size.max(1))
            .with_workers_per_kind(workers)
            .with_pending_timeout(Duration::from_secs(pending))
            .with_rebuild_interval(Duration::from_secs(rebuild.max(1)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use shelfmark_testing::MockConfigRepository;

    #[tokio::test]
    async fn test_typed_getters_fall_back_to_defaults() {
        let repo = Arc::new(MockConfigRepository::with_rows([
            ("max_borrow_books", "5"),
            ("overdue_fine_per_day", "0.5"),
            ("feature_enabled", "true"),
            ("broken", "five"),
        ]));
        let cache = ConfigCache::new(repo);
        cache.refresh().await.unwrap();

        assert_eq!(cache.get_int("max_borrow_books", 3).await, 5);
        assert!((cache.get_float("overdue_fine_per_day", 1.0).await - 0.5).abs() < f64::EPSILON);
        assert!(cache.get_bool("feature_enabled", false).await);
        assert_eq!(cache.get_int("broken", 7).await, 7);
        assert_eq!(cache.get("missing", "fallback").await, "fallback");
    }

    #[tokio::test]
    async fn test_read_through_and_repository_failure() {
        let repo = Arc::new(MockConfigRepository::with_rows([("borrow_days", "30")]));
        let cache = ConfigCache::new(Arc::clone(&repo));

        // Not refreshed: first read goes to the repository and is cached.
        assert_eq!(cache.get_int("borrow_days", 14).await, 30);
        repo.set_failing(true);
        assert_eq!(cache.get_int("borrow_days", 14).await, 30);
        assert_eq!(cache.get_int("renew_days", 15).await, 15);
        assert!(cache.refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_set_writes_through() {
        let repo = Arc::new(MockConfigRepository::new());
        let cache = ConfigCache::new(Arc::clone(&repo));

        cache.set("max_renew_times", "2").await.unwrap();
        assert_eq!(repo.get("max_renew_times").await.unwrap(), Some("2".to_string()));
        assert_eq!(cache.get_int("max_renew_times", 0).await, 2);

        repo.set_failing(true);
        assert!(cache.set("max_renew_times", "3").await.is_err());
        assert_eq!(cache.get_int("max_renew_times", 0).await, 2);
    }

    #[tokio::test]
    async fn test_engagement_overrides() {
        let repo = Arc::new(MockConfigRepository::with_rows([
            (keys::BATCH_SIZE, "250"),
            (keys::REBUILD_INTERVAL_SECS, "600"),
            (keys::WORKERS_PER_KIND, "many"),
        ]));
        let cache = ConfigCache::new(repo);

        let config = cache.engagement_config(EngagementConfig::default()).await;
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.rebuild_interval, Duration::from_secs(600));
        assert_eq!(config.workers_per_kind, 2);
        assert_eq!(config.pending_timeout, Duration::from_secs(30));
    }
}
