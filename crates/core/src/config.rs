//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CoreError, CoreResult, ProxyEntry, ProxyId, ProxyProtocol, Token};

/// Poll scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval for tokens that don't set their own
    pub default_interval_ms: u64,
    /// Floor under every token's interval
    pub min_interval_ms: u64,
    /// Per-cycle deadline for collecting fetch results
    pub cycle_deadline_ms: u64,
    /// Samples observed further than this from cycle start are dropped
    pub freshness_ms: u64,
    /// Fetches in flight across all tokens
    pub max_concurrent_fetches: usize,
    /// Re-list tokens from the store this often
    pub token_refresh_secs: u64,
    /// Consecutive fully-exhausted cycles before warning the operator
    pub exhaustion_warn_cycles: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 5_000,
            min_interval_ms: 500,
            cycle_deadline_ms: 4_000,
            freshness_ms: 4_000,
            max_concurrent_fetches: 15,
            token_refresh_secs: 60,
            exhaustion_warn_cycles: 10,
        }
    }
}

impl PipelineConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn token_refresh(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs)
    }
}

/// How the pool picks among usable proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    LeastRecentlyUsed,
    RoundRobin,
}

/// Proxy health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before healthy -> quarantined
    pub quarantine_after: u32,
    /// Consecutive failures before quarantined -> dead
    pub dead_after: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub selection: SelectionPolicy,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            quarantine_after: 3,
            dead_after: 5,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
            selection: SelectionPolicy::LeastRecentlyUsed,
        }
    }
}

impl ProxyPoolConfig {
    /// Backoff for a quarantined entry with `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let excess = failures.saturating_sub(self.quarantine_after).min(20);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << excess);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

/// History retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_hours: u64,
    pub prune_interval_secs: u64,
    /// Records buffered between the scheduler and the store writer
    pub queue_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_hours: 48,
            prune_interval_secs: 300,
            queue_depth: 1024,
        }
    }
}

impl HistoryConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Undelivered updates kept per subscriber before dropping the oldest
    pub queue_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// Exchange endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeEndpoints {
    pub mexc_url: String,
    pub dexscreener_url: String,
    /// Preferred dex on DexScreener pairs
    pub dexscreener_dex: String,
    pub jupiter_url: String,
    pub matcha_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self {
            mexc_url: "https://contract.mexc.com".to_string(),
            dexscreener_url: "https://api.dexscreener.com".to_string(),
            dexscreener_dex: "pancake".to_string(),
            jupiter_url: "https://ultra-api.jup.ag".to_string(),
            matcha_url: "https://matcha.xyz".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ExchangeEndpoints {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Imported proxy line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySeed {
    pub id: ProxyId,
    /// `[scheme://][login:pass@]host:port`
    pub proxy: String,
    #[serde(default)]
    pub protocol: ProxyProtocol,
}

/// Seed tokens and proxies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub tokens: Vec<Token>,
    pub proxies: Vec<ProxySeed>,
}

impl Catalog {
    pub fn proxy_entries(&self) -> CoreResult<Vec<ProxyEntry>> {
        self.proxies
            .iter()
            .map(|seed| ProxyEntry::parse(seed.id, &seed.proxy, seed.protocol))
            .collect()
    }
}

/// HTTP/WebSocket listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
        }
    }
}

/// Complete monitor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
    pub proxy: ProxyPoolConfig,
    pub history: HistoryConfig,
    pub hub: HubConfig,
    pub exchanges: ExchangeEndpoints,
    pub catalog: Catalog,
}

impl MonitorConfig {
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: &str| Err(CoreError::InvalidConfig(msg.to_string()));

        if self.pipeline.cycle_deadline_ms == 0 {
            return invalid("pipeline.cycle_deadline_ms must be positive");
        }
        if self.pipeline.max_concurrent_fetches == 0 {
            return invalid("pipeline.max_concurrent_fetches must be positive");
        }
        if self.pipeline.min_interval_ms == 0 {
            return invalid("pipeline.min_interval_ms must be positive");
        }
        if self.proxy.quarantine_after == 0 {
            return invalid("proxy.quarantine_after must be positive");
        }
        if self.proxy.dead_after < self.proxy.quarantine_after {
            return invalid("proxy.dead_after must be >= proxy.quarantine_after");
        }
        if self.history.queue_depth == 0 || self.hub.queue_depth == 0 {
            return invalid("queue depths must be positive");
        }
        if self.history.retention_hours == 0 {
            return invalid("history.retention_hours must be positive");
        }
        self.catalog.proxy_entries()?;
        Ok(())
    }
}
