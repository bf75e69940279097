//! Cache backend implementation with a shared Redis tier and a local
//! in-process fallback tier.
//!
//! Every operation is infallible from the caller's point of view: a Redis
//! outage degrades to the local tier and is logged, never surfaced. Request
//! handling must keep working when the shared backend is down.

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskhive_core::time::now_ms;

use super::keys::CACHE_PREFIX;

/// A cached entry with an absolute expiry.
///
/// The data is wrapped in `Arc` to allow cheap cloning on cache hits.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub expires_at: Instant,
}

impl CachedEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Fixed-window counter state, one per (policy, identity) pair.
#[derive(Debug)]
struct LocalCounter {
    count: u64,
    reset_at_ms: u64,
}

/// Result of an atomic [`CacheBackend::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at_ms: u64,
}

/// The in-process fallback tier: value entries plus window counters.
#[derive(Default)]
pub struct LocalTier {
    entries: DashMap<String, CachedEntry>,
    counters: DashMap<String, LocalCounter>,
}

impl LocalTier {
    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(Arc::clone(&entry.data)),
            Some(entry) => {
                // Lazy expiry: drop the stale entry on read.
                drop(entry);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
        self.counters.remove(key);
    }

    fn remove_matching(&self, pattern: &str) {
        self.entries.retain(|key, _| !key.contains(pattern));
        self.counters.retain(|key, _| !key.contains(pattern));
    }

    /// Atomic under the map's shard lock: two concurrent callers for the same
    /// key serialize here, so both observe distinct counts.
    fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let window_ms = window.as_millis() as u64;
        let now = now_ms();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(LocalCounter {
                count: 0,
                reset_at_ms: now + window_ms,
            });
        if now >= entry.reset_at_ms {
            entry.count = 0;
            entry.reset_at_ms = now + window_ms;
        }
        entry.count += 1;
        WindowCount {
            count: entry.count,
            reset_at_ms: entry.reset_at_ms,
        }
    }

    fn cleanup(&self) -> usize {
        let before = self.entries.len() + self.counters.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let now = now_ms();
        self.counters.retain(|_, counter| now < counter.reset_at_ms);
        before - (self.entries.len() + self.counters.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Two-tier cache backend: shared Redis plus a local fallback.
///
/// ## Cache Modes
///
/// - **Local**: single-instance mode using only the in-process tier
/// - **Redis**: multi-instance mode; Redis is authoritative, the local tier
///   absorbs operations whenever Redis is unreachable
#[derive(Clone)]
pub enum CacheBackend {
    /// Single-instance: local tier only
    Local(Arc<LocalTier>),

    /// Multi-instance: Redis + local fallback
    Redis { redis: Pool, local: Arc<LocalTier> },
}

impl CacheBackend {
    /// Create a new local-only cache backend.
    pub fn new_local() -> Self {
        CacheBackend::Local(Arc::new(LocalTier::default()))
    }

    /// Create a new Redis-backed cache backend.
    pub fn new_redis(redis_pool: Pool) -> Self {
        CacheBackend::Redis {
            redis: redis_pool,
            local: Arc::new(LocalTier::default()),
        }
    }

    /// Get a value. Redis is consulted first; on connection or command error
    /// the local tier answers instead. Expired entries are never returned.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self {
            CacheBackend::Local(local) => {
                let result = local.get(key);
                if result.is_some() {
                    crate::metrics::record_cache_hit("local");
                } else {
                    crate::metrics::record_cache_miss();
                }
                result
            }
            CacheBackend::Redis { redis, local } => match redis.get().await {
                Ok(mut conn) => match conn.get::<_, Option<Vec<u8>>>(key).await {
                    Ok(Some(data)) => {
                        tracing::debug!(key = %key, "cache hit (redis)");
                        crate::metrics::record_cache_hit("redis");
                        Some(Arc::new(data))
                    }
                    Ok(None) => {
                        tracing::debug!(key = %key, "cache miss");
                        crate::metrics::record_cache_miss();
                        None
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Redis GET error, using local tier");
                        local.get(key)
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to get Redis connection, using local tier");
                    local.get(key)
                }
            },
        }
    }

    /// Set a value with TTL. Written to Redis when reachable; on failure the
    /// local tier stores it with an absolute expiry instead. Never errors.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        match self {
            CacheBackend::Local(local) => local.set(key, value, ttl),
            CacheBackend::Redis { redis, local } => {
                let ttl_secs = ttl.as_secs().max(1);
                match redis.get().await {
                    Ok(mut conn) => {
                        if let Err(e) = conn.set_ex::<_, _, ()>(key, &value, ttl_secs).await {
                            tracing::warn!(key = %key, error = %e, "Redis SET error, using local tier");
                            local.set(key, value, ttl);
                        } else {
                            // A stale fallback copy must not shadow the newer
                            // shared value during a later outage.
                            local.remove(key);
                            tracing::debug!(key = %key, ttl_secs = %ttl_secs, "cache set (redis)");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to get Redis connection, using local tier");
                        local.set(key, value, ttl);
                    }
                }
            }
        }
    }

    /// Best-effort removal from both tiers.
    pub async fn delete(&self, key: &str) {
        match self {
            CacheBackend::Local(local) => local.remove(key),
            CacheBackend::Redis { redis, local } => {
                local.remove(key);
                match redis.get().await {
                    Ok(mut conn) => {
                        if let Err(e) = conn.del::<_, ()>(key).await {
                            tracing::warn!(key = %key, error = %e, "Redis DEL error");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to get Redis connection for DEL");
                    }
                }
            }
        }
    }

    /// Remove every key matching `pattern`.
    ///
    /// `pattern` is given without the namespace prefix, e.g. `workspace:42:`.
    /// Redis keys are matched by glob (`taskhive:workspace:42:*`); the local
    /// tier matches by substring.
    pub async fn invalidate_pattern(&self, pattern: &str) {
        match self {
            CacheBackend::Local(local) => local.remove_matching(pattern),
            CacheBackend::Redis { redis, local } => {
                local.remove_matching(pattern);
                let glob = format!("{CACHE_PREFIX}{pattern}*");
                match redis.get().await {
                    Ok(mut conn) => {
                        let keys: Vec<String> = {
                            match conn.scan_match::<_, String>(&glob).await {
                                Ok(mut iter) => {
                                    let mut keys = Vec::new();
                                    while let Some(key) = iter.next_item().await {
                                        keys.push(key);
                                    }
                                    keys
                                }
                                Err(e) => {
                                    tracing::warn!(pattern = %glob, error = %e, "Redis SCAN error");
                                    return;
                                }
                            }
                        };
                        if !keys.is_empty() {
                            let removed = keys.len();
                            if let Err(e) = conn.del::<_, ()>(keys).await {
                                tracing::warn!(pattern = %glob, error = %e, "Redis DEL error");
                            } else {
                                tracing::debug!(pattern = %glob, removed, "cache pattern invalidated");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to get Redis connection for SCAN");
                    }
                }
            }
        }
    }

    /// Atomically increment a fixed-window counter, starting the window (and
    /// its TTL) on first increment. Falls back to the local tier on Redis
    /// errors, which degrades cross-process coordination but keeps counting.
    pub async fn increment(&self, key: &str, window: Duration) -> WindowCount {
        match self {
            CacheBackend::Local(local) => local.increment(key, window),
            CacheBackend::Redis { redis, local } => match redis.get().await {
                Ok(mut conn) => match redis_increment(&mut conn, key, window).await {
                    Ok(count) => count,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Redis INCR error, using local tier");
                        local.increment(key, window)
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to get Redis connection, using local tier");
                    local.increment(key, window)
                }
            },
        }
    }

    /// Evict expired local entries and closed windows. Owned by a
    /// supervisor-scheduled task; safe to call at any time.
    pub fn cleanup(&self) -> usize {
        let removed = match self {
            CacheBackend::Local(local) => local.cleanup(),
            CacheBackend::Redis { local, .. } => local.cleanup(),
        };
        if removed > 0 {
            tracing::debug!(removed, "local cache cleanup");
        }
        removed
    }

    /// Local-tier statistics.
    pub fn stats(&self) -> CacheStats {
        match self {
            CacheBackend::Local(local) => CacheStats {
                local_entries: local.len(),
                mode: "local".to_string(),
            },
            CacheBackend::Redis { local, .. } => CacheStats {
                local_entries: local.len(),
                mode: "redis".to_string(),
            },
        }
    }

    /// Check if Redis is available (for readiness checks).
    pub async fn is_redis_available(&self) -> bool {
        match self {
            CacheBackend::Local(_) => false,
            CacheBackend::Redis { redis, .. } => redis.get().await.is_ok(),
        }
    }
}

/// Single-connection atomic window increment: INCR, then attach the window
/// TTL if the key has none, then read the remaining window.
async fn redis_increment(
    conn: &mut deadpool_redis::Connection,
    key: &str,
    window: Duration,
) -> redis::RedisResult<WindowCount> {
    let count: u64 = conn.incr(key, 1i64).await?;
    let mut ttl_ms: i64 = conn.pttl(key).await?;
    if ttl_ms < 0 {
        let window_ms = window.as_millis() as i64;
        conn.pexpire::<_, ()>(key, window_ms).await?;
        ttl_ms = window_ms;
    }
    Ok(WindowCount {
        count,
        reset_at_ms: now_ms() + ttl_ms as u64,
    })
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub local_entries: usize,
    pub mode: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::cache_key;

    #[tokio::test]
    async fn test_get_absent_key() {
        let cache = CacheBackend::new_local();
        assert!(cache.get("taskhive:missing").await.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let cache = CacheBackend::new_local();
        let key = cache_key("workspace", 7, &[]);
        cache.set(&key, b"payload".to_vec(), Duration::from_secs(30)).await;
        let value = cache.get(&key).await.expect("value present");
        assert_eq!(value.as_slice(), b"payload");
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = CacheBackend::new_local();
        cache
            .set("taskhive:short", b"x".to_vec(), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("taskhive:short").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let cache = CacheBackend::new_local();
        cache
            .set("taskhive:gone", b"x".to_vec(), Duration::from_secs(30))
            .await;
        cache.delete("taskhive:gone").await;
        assert!(cache.get("taskhive:gone").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_pattern_scopes_to_prefix() {
        let cache = CacheBackend::new_local();
        let ttl = Duration::from_secs(30);
        cache
            .set(&cache_key("workspace", "W", &["tasks", "h1"]), b"a".to_vec(), ttl)
            .await;
        cache
            .set(&cache_key("workspace", "W", &["members"]), b"b".to_vec(), ttl)
            .await;
        cache
            .set(&cache_key("workspace", "OTHER", &["tasks"]), b"c".to_vec(), ttl)
            .await;

        cache.invalidate_pattern("workspace:W:").await;

        assert!(cache
            .get(&cache_key("workspace", "W", &["tasks", "h1"]))
            .await
            .is_none());
        assert!(cache
            .get(&cache_key("workspace", "W", &["members"]))
            .await
            .is_none());
        assert!(cache
            .get(&cache_key("workspace", "OTHER", &["tasks"]))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let cache = CacheBackend::new_local();
        let window = Duration::from_secs(60);
        let first = cache.increment("taskhive:ratelimit:api:u1", window).await;
        let second = cache.increment("taskhive:ratelimit:api:u1", window).await;
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.reset_at_ms, second.reset_at_ms);
        assert!(first.reset_at_ms > now_ms());
    }

    #[tokio::test]
    async fn test_increment_starts_fresh_window_after_expiry() {
        let cache = CacheBackend::new_local();
        let window = Duration::from_millis(40);
        let key = "taskhive:ratelimit:api:u2";
        cache.increment(key, window).await;
        cache.increment(key, window).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = cache.increment(key, window).await;
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_increment_isolated_per_key() {
        let cache = CacheBackend::new_local();
        let window = Duration::from_secs(60);
        cache.increment("taskhive:ratelimit:api:a", window).await;
        let other = cache.increment("taskhive:ratelimit:api:b", window).await;
        assert_eq!(other.count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_expired() {
        let cache = CacheBackend::new_local();
        cache
            .set("taskhive:stale", b"x".to_vec(), Duration::from_millis(5))
            .await;
        cache
            .set("taskhive:live", b"y".to_vec(), Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = cache.cleanup();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().local_entries, 1);
        assert!(cache.get("taskhive:live").await.is_some());
    }
}
