//! Shelfmark engagement service.
//!
//! Wires Redis and Postgres into the toggle, pipeline and ranking engines,
//! serves the HTTP API and shuts the background workers down cleanly on
//! SIGTERM or Ctrl+C.

mod config;

use config::Config;
use shelfmark_core::EngagementConfig;
use shelfmark_core::environment::{Clock, SystemClock};
use shelfmark_postgres::{PostgresConfigRepository, PostgresEngagementRepository};
use shelfmark_redis::RedisFastStore;
use shelfmark_runtime::metrics::MetricsServer;
use shelfmark_runtime::{
    ConfigCache, RankingEngine, RebuildScheduler, ReconciliationPipeline, RetryPolicy,
    TaskSupervisor, ToggleEngine, retry_with_backoff, wait_for_signal,
};
use shelfmark_web::{AppState, router};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelfmark=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        http_addr = %config.http_addr,
        sync_workers = config.sync_workers,
        rebuild_secs = config.ranking_rebuild.as_secs(),
        "Starting Shelfmark engagement service"
    );

    let mut metrics = MetricsServer::new();
    metrics.start()?;

    // Backing stores may still be starting (compose, k8s), so retry connects.
    let startup = RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();

    info!("Connecting to PostgreSQL...");
    let repo = retry_with_backoff(&startup, "connect_postgres", || {
        PostgresEngagementRepository::connect(&config.database_url)
    })
    .await?;
    repo.migrate().await?;
    info!("PostgreSQL connected, migrations applied");

    info!("Connecting to Redis...");
    let store = retry_with_backoff(&startup, "connect_redis", || {
        RedisFastStore::new(&config.redis_url)
    })
    .await?;
    info!("Redis connected");

    // Runtime overrides from `system_configs` win over the environment.
    let overrides = ConfigCache::new(Arc::new(PostgresConfigRepository::new(
        repo.pool().clone(),
    )));
    if let Err(e) = overrides.refresh().await {
        warn!(error = %e, "Failed to load runtime configuration, using defaults");
    }
    let engagement = overrides
        .engagement_config(
            EngagementConfig::default()
                .with_workers_per_kind(config.sync_workers)
                .with_rebuild_interval(config.ranking_rebuild),
        )
        .await;

    let store = Arc::new(store);
    let repo = Arc::new(repo);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let toggles = ToggleEngine::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        Arc::clone(&clock),
        engagement.clone(),
    );
    let rankings = RankingEngine::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        Arc::clone(&clock),
        engagement.clone(),
    );

    if let Err(e) = toggles.warm_counters().await {
        warn!(error = %e, "Failed to warm cached counters, they will load on demand");
    }

    // Background tasks
    let mut supervisor = TaskSupervisor::new();
    let pipeline = ReconciliationPipeline::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        engagement.clone(),
    );
    let workers = pipeline.start(&mut supervisor).await?;
    let scheduler = RebuildScheduler::new(rankings.clone(), engagement.rebuild_interval);
    let signal = supervisor.signal();
    supervisor.spawn("ranking-rebuild", scheduler.run(signal));
    info!(workers, "Background tasks started");

    let app = router(AppState::new(toggles, rankings, metrics));
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(address = %config.http_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    info!("HTTP server stopped, draining background tasks");
    if let Err(failed) = supervisor.shutdown(config.shutdown_timeout).await {
        warn!(tasks = ?failed, "Some background tasks did not stop cleanly");
    }

    info!("Server stopped");
    Ok(())
}
