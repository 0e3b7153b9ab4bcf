//! Engine configuration
//!
//! Loaded from a TOML file (every field has a default) and then overridden by
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::metadata::retry::RetryPolicy;

/// Gnosis Chain public RPCs, where the futarchy markets live.
pub const DEFAULT_RPC_ENDPOINTS: &[&str] = &[
    "https://rpc.gnosischain.com",
    "https://gnosis-rpc.publicnode.com",
    "https://1rpc.io/gnosis",
];

pub const DEFAULT_BASE_CURRENCY: &str = "sDAI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Config file (or defaults) plus environment overrides
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let path = std::env::var("FUTARCHY_SYNC_CONFIG")
            .unwrap_or_else(|_| "futarchy_sync.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FUTARCHY_RPC_URLS") {
            let urls: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                self.rpc.endpoints = urls;
            }
        }
        if let Ok(v) = std::env::var("FUTARCHY_BASE_CURRENCY") {
            if !v.trim().is_empty() {
                self.pipeline.base_currency_symbol = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("FUTARCHY_POLL_INTERVAL_SECS") {
            self.pipeline.poll_interval_secs = v.parse().unwrap_or(self.pipeline.poll_interval_secs);
        }
        if let Ok(v) = std::env::var("FUTARCHY_MARKET_CONFIG") {
            self.pipeline.market_config_path = Some(v);
        }
    }
}

/// RPC endpoints and cooldown windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    #[serde(default = "default_cooldown_jitter_ms")]
    pub cooldown_jitter_ms: u64,

    /// Upper bound on any cooldown, jitter included
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_endpoints() -> Vec<String> {
    DEFAULT_RPC_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}
fn default_cooldown_base_ms() -> u64 {
    5_000
}
fn default_cooldown_jitter_ms() -> u64 {
    2_000
}
fn default_max_cooldown_ms() -> u64 {
    60_000
}
fn default_request_timeout_ms() -> u64 {
    8_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            cooldown_base_ms: default_cooldown_base_ms(),
            cooldown_jitter_ms: default_cooldown_jitter_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Symbol lookup retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_resolver_backoff_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_resolver_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_resolver_attempts() -> u32 {
    3
}
fn default_resolver_backoff_ms() -> u64 {
    250
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_resolver_backoff_max_ms() -> u64 {
    2_000
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_resolver_attempts(),
            backoff_base_ms: default_resolver_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_resolver_backoff_max_ms(),
        }
    }
}

impl ResolverConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a wallet's trade snapshot is served without refetching
    #[serde(default = "default_trade_ttl_secs")]
    pub trade_ttl_secs: u64,
}

fn default_trade_ttl_secs() -> u64 {
    15
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            trade_ttl_secs: default_trade_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn trade_ttl(&self) -> Duration {
        Duration::from_secs(self.trade_ttl_secs)
    }
}

/// Per-wallet pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    #[serde(default = "default_fetch_retry_ms")]
    pub fetch_retry_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub fetch_retry_multiplier: f64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_base_currency")]
    pub base_currency_symbol: String,

    /// JSON token configuration (see `MarketConfig`)
    #[serde(default)]
    pub market_config_path: Option<String>,
}

fn default_fetch_attempts() -> u32 {
    3
}
fn default_fetch_retry_ms() -> u64 {
    1_000
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_base_currency() -> String {
    DEFAULT_BASE_CURRENCY.to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: default_fetch_attempts(),
            fetch_retry_base_ms: default_fetch_retry_ms(),
            fetch_retry_multiplier: default_backoff_multiplier(),
            poll_interval_secs: default_poll_interval_secs(),
            base_currency_symbol: default_base_currency(),
            market_config_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.fetch_retry_base_ms);
        RetryPolicy::exponential(
            self.fetch_attempts,
            base,
            self.fetch_retry_multiplier,
            base * 8,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
