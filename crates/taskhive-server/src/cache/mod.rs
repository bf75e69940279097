//! Two-tier caching system for horizontal scaling.
//!
//! ## Architecture
//!
//! - **Shared tier (Redis)**: network, shared across instances
//! - **Local tier (DashMap)**: in-memory fallback, per-instance
//!
//! ## Graceful Degradation
//!
//! The shared tier is authoritative; if Redis is unavailable or disabled,
//! every operation silently falls back to the local tier. A cache-layer
//! outage degrades request handling (stale or uncached responses), it never
//! breaks it.

pub mod backend;
pub mod keys;

pub use backend::{CacheBackend, CacheStats, CachedEntry, WindowCount};
pub use keys::{cache_key, CacheKey, CACHE_PREFIX, KEY_DELIMITER};
