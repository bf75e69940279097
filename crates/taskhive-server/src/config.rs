use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rate limit policy table
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Cache validation
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.cache.cleanup_interval_secs == 0 {
            return Err("cache.cleanup_interval_secs must be > 0".into());
        }
        // Rate limit validation
        for (name, policy) in [
            ("api", &self.rate_limit.api),
            ("auth", &self.rate_limit.auth),
            ("upload", &self.rate_limit.upload),
            ("search", &self.rate_limit.search),
        ] {
            if policy.max_requests == 0 {
                return Err(format!("rate_limit.{name}.max_requests must be > 0"));
            }
            if policy.window_secs == 0 {
                return Err(format!("rate_limit.{name}.window_secs must be > 0"));
            }
        }
        // Redis validation
        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deployment environment; anything other than "production" attaches
    /// internal error detail to 500 responses.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Maximum accepted request body size for mutating methods.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_environment() -> String {
    "development".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (disabled for single-instance deployments)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds; a stalled backend must not stall
    /// request handling.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_pool_size() -> usize {
    10
}
fn default_redis_timeout_ms() -> u64 {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL for cache entries, including cached responses.
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Interval for the supervisor-owned local cleanup task.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// One fixed-window policy: `max_requests` per `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl PolicySettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Named rate-limit policies, one per traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// General API traffic: 1000 requests / 15 minutes
    #[serde(default = "default_api_policy")]
    pub api: PolicySettings,
    /// Authentication attempts: 5 requests / 15 minutes
    #[serde(default = "default_auth_policy")]
    pub auth: PolicySettings,
    /// Uploads: 10 requests / 60 seconds
    #[serde(default = "default_upload_policy")]
    pub upload: PolicySettings,
    /// Search: 60 requests / 60 seconds
    #[serde(default = "default_search_policy")]
    pub search: PolicySettings,
}

fn default_api_policy() -> PolicySettings {
    PolicySettings {
        max_requests: 1000,
        window_secs: 15 * 60,
    }
}
fn default_auth_policy() -> PolicySettings {
    PolicySettings {
        max_requests: 5,
        window_secs: 15 * 60,
    }
}
fn default_upload_policy() -> PolicySettings {
    PolicySettings {
        max_requests: 10,
        window_secs: 60,
    }
}
fn default_search_policy() -> PolicySettings {
    PolicySettings {
        max_requests: 60,
        window_secs: 60,
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            api: default_api_policy(),
            auth: default_auth_policy(),
            upload: default_upload_policy(),
            search: default_search_policy(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load configuration from an optional TOML file merged with
    /// `TASKHIVE__`-prefixed environment overrides,
    /// e.g. `TASKHIVE__SERVER__PORT=9090`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("taskhive.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("TASKHIVE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.cache.default_ttl_secs, 300);
        assert!(!cfg.redis.enabled);
        assert!(!cfg.server.is_production());
    }

    #[test]
    fn test_default_policy_table() {
        let rl = RateLimitSettings::default();
        assert_eq!(rl.api.max_requests, 1000);
        assert_eq!(rl.api.window_secs, 900);
        assert_eq!(rl.auth.max_requests, 5);
        assert_eq!(rl.auth.window_secs, 900);
        assert_eq!(rl.upload.max_requests, 10);
        assert_eq!(rl.upload.window_secs, 60);
        assert_eq!(rl.search.max_requests, 60);
        assert_eq!(rl.search.window_secs, 60);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.auth.window_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_addr_parses_host() {
        let mut cfg = AppConfig::default();
        cfg.server.host = "127.0.0.1".into();
        cfg.server.port = 9090;
        assert_eq!(cfg.addr().to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn test_production_detection() {
        let mut cfg = AppConfig::default();
        cfg.server.environment = "Production".into();
        assert!(cfg.server.is_production());
    }
}
