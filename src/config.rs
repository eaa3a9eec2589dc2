use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub updates: UpdateConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_stats_interval")]
    pub log_interval_seconds: u64,
}

/// Tunables for the policy cache layer and the outage fallback.
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_policy_capacity")]
    pub cache_capacity: usize,
    /// When the rule store is unreachable and no cached value exists,
    /// `true` resolves the query anyway, `false` answers SERVFAIL.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    /// Where the local recursive resolver listens when upstream_mode = unbound.
    #[serde(default = "default_unbound_addr")]
    pub unbound_addr: String,
    #[serde(default = "default_bootstrap_dns")]
    pub bootstrap_dns: Vec<String>,
}

/// Response cache for upstream answers, distinct from the policy caches.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enable")]
    pub enable: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_sec: u64,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpdateConfig {
    #[serde(default = "default_update_interval")]
    pub interval_hours: u64,
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_enable")]
    pub enable: bool,
    #[serde(default = "default_log_blocked")]
    pub log_blocked: bool,
    #[serde(default = "default_log_all_queries")]
    pub log_all_queries: bool,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_query_log_sinks")]
    pub query_log_sinks: Vec<String>,
    #[serde(default = "default_sqlite_retention_hours")]
    pub sqlite_retention_hours: u64,
}

// Defaults
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5300
}
fn default_api_port() -> u16 {
    8080
}
fn default_db_path() -> String {
    "dns-warden.db".to_string()
}
fn default_policy_ttl() -> u64 {
    30
}
fn default_policy_capacity() -> usize {
    10_000
}
fn default_fail_open() -> bool {
    true
}
fn default_upstream_timeout_ms() -> u64 {
    3000
}
fn default_unbound_addr() -> String {
    "127.0.0.1:5335".to_string()
}
fn default_bootstrap_dns() -> Vec<String> {
    vec!["8.8.8.8:53".to_string()]
}
fn default_cache_enable() -> bool {
    true
}
fn default_cache_capacity() -> u64 {
    10000
}
fn default_grace_period() -> u64 {
    10
}
fn default_min_ttl() -> u32 {
    300
}
fn default_update_interval() -> u64 {
    24
}
fn default_concurrent_downloads() -> usize {
    4
}
fn default_log_enable() -> bool {
    true
}
fn default_log_blocked() -> bool {
    true
}
fn default_log_all_queries() -> bool {
    true
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_query_log_sinks() -> Vec<String> {
    vec!["console".to_string()]
}
fn default_sqlite_retention_hours() -> u64 {
    168 // 7 days
}
fn default_stats_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_port: default_api_port(),
            db_path: default_db_path(),
            policy: PolicyConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            updates: UpdateConfig::default(),
            logging: LoggingConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            log_interval_seconds: default_stats_interval(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_policy_ttl(),
            cache_capacity: default_policy_capacity(),
            fail_open: default_fail_open(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_upstream_timeout_ms(),
            unbound_addr: default_unbound_addr(),
            bootstrap_dns: default_bootstrap_dns(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: default_cache_enable(),
            capacity: default_cache_capacity(),
            grace_period_sec: default_grace_period(),
            min_ttl: default_min_ttl(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_update_interval(),
            concurrent_downloads: default_concurrent_downloads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable: default_log_enable(),
            log_blocked: default_log_blocked(),
            log_all_queries: default_log_all_queries(),
            format: default_log_format(),
            level: default_log_level(),
            query_log_sinks: default_query_log_sinks(),
            sqlite_retention_hours: default_sqlite_retention_hours(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }
}
