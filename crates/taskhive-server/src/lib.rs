pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod rate_limit;
pub mod server;

pub use cache::{cache_key, CacheBackend, CacheKey, CachedEntry};
pub use config::{AppConfig, CacheConfig, RedisConfig, ServerConfig};
pub use error::ApiError;
pub use middleware::AuthenticatedUser;
pub use observability::{apply_logging_level, init_tracing};
pub use rate_limit::{PolicyKind, RateLimitDecision, RateLimiter, RateLimiters};
pub use server::{
    apply_pipeline, build_app, AppState, PipelineConfig, ServerBuilder, TaskhiveServer,
};

/// Create a cache backend based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: Returns local-only cache
/// - **Redis enabled**: Connects a Redis pool; the backend falls back to the
///   local tier per-operation whenever Redis is unreachable
///
/// ## Graceful Degradation
///
/// If the Redis pool cannot even be constructed the server starts in
/// local-only mode. A pool that exists but cannot connect stays in Redis mode
/// so the backend recovers automatically once Redis returns.
pub async fn create_cache_backend(config: &RedisConfig) -> CacheBackend {
    use std::time::Duration;

    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return CacheBackend::new_local();
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));
    }

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheBackend::new_local();
        }
    };

    match pool.get().await {
        Ok(_) => tracing::info!("Connected to Redis successfully"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis not reachable yet; operations fall back to the local tier"
        ),
    }

    CacheBackend::new_redis(pool)
}
