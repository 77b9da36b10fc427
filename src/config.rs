use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address the proxy listens on (e.g. `0.0.0.0:3000`).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Far-tier (Redis) connection URI.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Upstream origin base URL.
    #[serde(default = "default_origin_url")]
    pub origin_url: String,
    /// Fallback TTL in seconds when no TTL rule matches.
    #[serde(default = "default_cache_ttl")]
    pub cache_default_ttl: u64,
    /// Near-tier (in-process) entry capacity.
    #[serde(default = "default_l1_maxsize")]
    pub l1_cache_maxsize: usize,
    /// Paths that bypass the cache entirely.
    #[serde(default = "default_skip_paths")]
    pub cache_skip_paths: Vec<String>,
    /// TTL seconds by media type (parameters stripped, case-insensitive).
    #[serde(default = "default_ttl_by_content_type")]
    pub ttl_by_content_type: HashMap<String, u64>,
    /// Ordered path-pattern TTL rules; the first matching glob wins.
    #[serde(default = "default_ttl_by_path_pattern")]
    pub ttl_by_path_pattern: Vec<PathTtlRule>,
    /// TTL seconds by exact HTTP status code.
    #[serde(default = "default_ttl_by_status_code")]
    pub ttl_by_status_code: HashMap<u16, u64>,
    /// Extra seconds the stale copy outlives the fresh copy.
    #[serde(default = "default_stale_ttl_offset")]
    pub stale_ttl_offset: u64,
    /// Lease of the coalescing lock used by background refreshes.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_seconds: u64,
    /// Total back-off budget for coalescing losers before a direct fetch.
    #[serde(default = "default_loser_max_wait")]
    pub loser_max_wait_ms: u64,
    /// Include the normalised query string in the cache key.
    #[serde(default)]
    pub cache_key_include_query: bool,
    /// Deadline for every far-tier round-trip.
    #[serde(default = "default_far_tier_timeout")]
    pub far_tier_timeout_ms: u64,
    /// Deadline for an origin fetch.
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout_seconds: u64,
    /// Far-tier connection pool size.
    #[serde(default = "default_redis_pool_size")]
    pub redis_pool_size: usize,
    /// Capacity of the background refresh queue; excess tasks are dropped.
    #[serde(default = "default_refresh_queue_size")]
    pub refresh_queue_size: usize,
    /// TTL of the near-tier "refresh pending" mark.
    #[serde(default = "default_refresh_mark_ttl")]
    pub refresh_mark_ttl_seconds: u64,
}

/// A single `(glob, ttl)` path rule.
#[derive(Debug, Clone, Deserialize)]
pub struct PathTtlRule {
    pub pattern: String,
    pub ttl: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_origin_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_l1_maxsize() -> usize {
    1000
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/favicon.ico".to_string()]
}

fn default_ttl_by_content_type() -> HashMap<String, u64> {
    HashMap::from([("application/json".to_string(), 30)])
}

fn default_ttl_by_path_pattern() -> Vec<PathTtlRule> {
    vec![PathTtlRule {
        pattern: "/static/*".to_string(),
        ttl: 600,
    }]
}

fn default_ttl_by_status_code() -> HashMap<u16, u64> {
    HashMap::from([(200, 5), (404, 10)])
}

fn default_stale_ttl_offset() -> u64 {
    60
}

fn default_lock_lease() -> u64 {
    10
}

fn default_loser_max_wait() -> u64 {
    500
}

fn default_far_tier_timeout() -> u64 {
    250
}

fn default_origin_timeout() -> u64 {
    10
}

fn default_redis_pool_size() -> usize {
    20
}

fn default_refresh_queue_size() -> usize {
    64
}

fn default_refresh_mark_ttl() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply environment-variable
/// overrides, and validate it.
///
/// Every key can be overridden by an environment variable with the
/// upper-cased key name (e.g. `REDIS_URL`, `CACHE_DEFAULT_TTL`).  Compound
/// keys (`CACHE_SKIP_PATHS`, `TTL_BY_*`) are parsed as JSON.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let raw = match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("failed to read config file: {}", p.display()))?,
        None => String::from("{}"),
    };
    let mut config: Config = serde_yaml::from_str(&raw).with_context(|| match path {
        Some(p) => format!("failed to parse config file: {}", p.display()),
        None => "failed to build default configuration".to_string(),
    })?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    override_string(&mut config.listen_addr, "LISTEN_ADDR");
    override_string(&mut config.redis_url, "REDIS_URL");
    override_string(&mut config.origin_url, "ORIGIN_URL");
    override_parsed(&mut config.cache_default_ttl, "CACHE_DEFAULT_TTL");
    override_parsed(&mut config.l1_cache_maxsize, "L1_CACHE_MAXSIZE");
    override_json(&mut config.cache_skip_paths, "CACHE_SKIP_PATHS");
    override_json(&mut config.ttl_by_content_type, "TTL_BY_CONTENT_TYPE");
    override_json(&mut config.ttl_by_path_pattern, "TTL_BY_PATH_PATTERN");
    override_json(&mut config.ttl_by_status_code, "TTL_BY_STATUS_CODE");
    override_parsed(&mut config.stale_ttl_offset, "STALE_TTL_OFFSET");
    override_parsed(&mut config.lock_lease_seconds, "LOCK_LEASE_SECONDS");
    override_parsed(&mut config.loser_max_wait_ms, "LOSER_MAX_WAIT_MS");
    override_parsed(&mut config.cache_key_include_query, "CACHE_KEY_INCLUDE_QUERY");
    override_parsed(&mut config.far_tier_timeout_ms, "FAR_TIER_TIMEOUT_MS");
    override_parsed(&mut config.origin_timeout_seconds, "ORIGIN_TIMEOUT_SECONDS");
    override_parsed(&mut config.redis_pool_size, "REDIS_POOL_SIZE");
    override_parsed(&mut config.refresh_queue_size, "REFRESH_QUEUE_SIZE");
    override_parsed(&mut config.refresh_mark_ttl_seconds, "REFRESH_MARK_TTL_SECONDS");
}

fn override_string(field: &mut String, name: &str) {
    if let Ok(value) = std::env::var(name) {
        *field = value;
    }
}

fn override_parsed<T: std::str::FromStr>(field: &mut T, name: &str) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(var = name, %raw, "ignoring unparseable override"),
        }
    }
}

fn override_json<T: serde::de::DeserializeOwned>(field: &mut T, name: &str) {
    if let Ok(raw) = std::env::var(name) {
        match parse_json_override(&raw) {
            Some(value) => *field = value,
            None => tracing::warn!(var = name, %raw, "ignoring malformed JSON override"),
        }
    }
}

fn parse_json_override<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(raw).ok()
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        (1..=86_400).contains(&config.cache_default_ttl),
        "cache_default_ttl must be in range 1-86400"
    );
    anyhow::ensure!(config.l1_cache_maxsize > 0, "l1_cache_maxsize must be positive");
    anyhow::ensure!(config.redis_pool_size > 0, "redis_pool_size must be positive");
    anyhow::ensure!(
        config.refresh_queue_size > 0,
        "refresh_queue_size must be positive"
    );
    anyhow::ensure!(
        config.lock_lease_seconds > 0,
        "lock_lease_seconds must be positive"
    );
    anyhow::ensure!(!config.origin_url.is_empty(), "origin_url must not be empty");
    anyhow::ensure!(!config.redis_url.is_empty(), "redis_url must not be empty");
    Ok(())
}
