//! Fixed-window request rate limiting.
//!
//! Counters live in the cache under `taskhive:ratelimit:{policy}:{identity}`
//! and are advanced with the cache's atomic increment, so concurrent requests
//! from the same identity always observe distinct counts. Because the cache
//! never errors, neither does the limiter: a shared-backend outage degrades
//! limiting to per-process counting instead of rejecting traffic.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, CACHE_PREFIX};
use crate::config::RateLimitSettings;
use taskhive_core::time::now_ms;

/// Immutable fixed-window policy.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u64,
}

/// Outcome of a limit check.
///
/// `total_hits` reflects offered load: requests over the limit are still
/// counted, only not executed.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub total_hits: u64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let remaining_ms = self.reset_at_ms.saturating_sub(now_ms());
        remaining_ms.div_ceil(1000).max(1)
    }

    /// Window reset as epoch seconds, for the `X-RateLimit-Reset` header.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms / 1000
    }
}

/// One named fixed-window limiter.
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    cache: CacheBackend,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, policy: RateLimitPolicy, cache: CacheBackend) -> Self {
        Self {
            name: name.into(),
            policy,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn window_key(&self, identifier: &str) -> String {
        format!("{CACHE_PREFIX}ratelimit:{}:{}", self.name, identifier)
    }

    /// Count this request against the caller's current window and decide.
    ///
    /// The first request of a window starts it with count 1; every request
    /// within the window increments, including rejected ones.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = self.window_key(identifier);
        let window = self.cache.increment(&key, self.policy.window).await;

        let allowed = window.count <= self.policy.max_requests;
        if !allowed {
            tracing::debug!(
                policy = %self.name,
                identifier = %identifier,
                total_hits = window.count,
                "rate limit exceeded"
            );
            crate::metrics::record_rate_limited(&self.name);
        }

        RateLimitDecision {
            allowed,
            remaining: self.policy.max_requests.saturating_sub(window.count),
            reset_at_ms: window.reset_at_ms,
            total_hits: window.count,
        }
    }

    /// Administrative override: drop the caller's window, granting a fresh
    /// quota immediately. Not used by normal request flow.
    pub async fn reset(&self, identifier: &str) {
        self.cache.delete(&self.window_key(identifier)).await;
    }
}

/// Selects which named limiter applies to a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Api,
    Auth,
    Upload,
    Search,
}

/// The process-wide set of named limiters, one per traffic class, all sharing
/// one cache backend. Constructed once at startup and threaded through
/// application state.
pub struct RateLimiters {
    pub api: RateLimiter,
    pub auth: RateLimiter,
    pub upload: RateLimiter,
    pub search: RateLimiter,
}

impl RateLimiters {
    pub fn from_settings(settings: &RateLimitSettings, cache: CacheBackend) -> Arc<Self> {
        let limiter = |name: &str, max_requests: u64, window: Duration| {
            RateLimiter::new(
                name,
                RateLimitPolicy {
                    window,
                    max_requests,
                },
                cache.clone(),
            )
        };
        Arc::new(Self {
            api: limiter("api", settings.api.max_requests, settings.api.window()),
            auth: limiter("auth", settings.auth.max_requests, settings.auth.window()),
            upload: limiter("upload", settings.upload.max_requests, settings.upload.window()),
            search: limiter("search", settings.search.max_requests, settings.search.window()),
        })
    }

    pub fn select(&self, kind: PolicyKind) -> &RateLimiter {
        match kind {
            PolicyKind::Api => &self.api,
            PolicyKind::Auth => &self.auth,
            PolicyKind::Upload => &self.upload,
            PolicyKind::Search => &self.search,
        }
    }
}
