use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tower_http::cors::CorsLayer;

use taskhive_core::PerformanceMonitor;

use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::handlers;
use crate::middleware as app_middleware;
use crate::rate_limit::{PolicyKind, RateLimiters};

/// Process-wide services, constructed once at startup and threaded through
/// the router. There are no module-level singletons; tests build their own
/// isolated state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: CacheBackend,
    pub monitor: Arc<PerformanceMonitor>,
    pub limiters: Arc<RateLimiters>,
}

impl AppState {
    pub fn new(config: AppConfig, cache: CacheBackend) -> Self {
        let limiters = RateLimiters::from_settings(&config.rate_limit, cache.clone());
        Self {
            config: Arc::new(config),
            cache,
            monitor: Arc::new(PerformanceMonitor::new()),
            limiters,
        }
    }
}

/// Stage selection for one router subtree.
///
/// Callers may omit stages (no caching for auth routes, no rate limiting for
/// internal calls), but the relative order of included stages is fixed:
/// security, error boundary, logging, rate limiting, validation, compression,
/// response caching.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub rate_limit: Option<PolicyKind>,
    pub validation: bool,
    pub compression: bool,
    pub caching: bool,
    /// Response-cache TTL for this subtree; `None` uses the configured
    /// default.
    pub cache_ttl: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate_limit: Some(PolicyKind::Api),
            validation: true,
            compression: true,
            caching: true,
            cache_ttl: None,
        }
    }
}

impl PipelineConfig {
    /// Authentication routes: strict limiting, never cached.
    pub fn auth() -> Self {
        Self {
            rate_limit: Some(PolicyKind::Auth),
            caching: false,
            ..Self::default()
        }
    }

    /// Upload routes: large-body limiting, no caching or compression marks.
    pub fn upload() -> Self {
        Self {
            rate_limit: Some(PolicyKind::Upload),
            caching: false,
            compression: false,
            ..Self::default()
        }
    }

    /// Search routes: tight quota, cached reads.
    pub fn search() -> Self {
        Self {
            rate_limit: Some(PolicyKind::Search),
            ..Self::default()
        }
    }
}

/// Wrap `router` with the middleware pipeline.
///
/// Axum runs the last layer added first, so stages are added innermost-first
/// to realize the canonical order.
pub fn apply_pipeline(router: Router, state: &AppState, pipeline: PipelineConfig) -> Router {
    let mut router = router;

    if pipeline.caching {
        let st = state.clone();
        let ttl = pipeline
            .cache_ttl
            .unwrap_or_else(|| state.config.cache.default_ttl());
        router = router.layer(middleware::from_fn(move |req, next| {
            let st = st.clone();
            async move { app_middleware::response_cache(st, ttl, req, next).await }
        }));
    }
    if pipeline.compression {
        router = router.layer(middleware::from_fn(app_middleware::compression));
    }
    if pipeline.validation {
        let limit = state.config.server.body_limit_bytes;
        router = router.layer(middleware::from_fn(move |req, next| async move {
            app_middleware::validate_request(limit, req, next).await
        }));
    }
    if let Some(policy) = pipeline.rate_limit {
        let st = state.clone();
        router = router.layer(middleware::from_fn(move |req, next| {
            let st = st.clone();
            async move { app_middleware::rate_limit(st, policy, req, next).await }
        }));
    }
    let st = state.clone();
    router = router.layer(middleware::from_fn(move |req, next| {
        let st = st.clone();
        async move { app_middleware::request_logging(st, req, next).await }
    }));
    let st = state.clone();
    router = router.layer(middleware::from_fn(move |req, next| {
        let st = st.clone();
        async move { app_middleware::error_boundary(st, req, next).await }
    }));
    router.layer(middleware::from_fn(app_middleware::security_headers))
}

/// Build the infrastructure router: operational endpoints wrapped with the
/// default pipeline. The route layer mounts business routes the same way.
pub fn build_app(state: AppState) -> Router {
    let ops = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/performance", get(handlers::performance_summary))
        .with_state(state.clone());

    apply_pipeline(ops, &state, PipelineConfig::default()).layer(CorsLayer::permissive())
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub async fn build(self) -> TaskhiveServer {
        let addr = self.config.addr();
        let cache = crate::create_cache_backend(&self.config.redis).await;
        let state = AppState::new(self.config, cache);
        let app = build_app(state.clone());
        TaskhiveServer { addr, state, app }
    }
}

pub struct TaskhiveServer {
    addr: SocketAddr,
    state: AppState,
    app: Router,
}

impl TaskhiveServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        // Local cache cleanup is owned by the server supervisor, not by the
        // cache module itself.
        let cache = self.state.cache.clone();
        let interval = self.state.config.cache.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup();
                let stats = cache.stats();
                crate::metrics::set_cache_entries(&stats.mode, stats.local_entries);
            }
        });

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
