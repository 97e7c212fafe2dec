//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::extract::Chain;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub filters: FilterRules,
    #[serde(default)]
    pub wallets: Vec<WatchedWallet>,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            channels: Vec::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_file")]
    pub file: String,
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file: default_cache_file(),
            update_interval_secs: default_update_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterRules {
    /// Network ids alerts may come from
    #[serde(default = "default_chains")]
    pub chains: Vec<String>,
    #[serde(default)]
    pub min_price_usd: f64,
    #[serde(default)]
    pub min_liquidity_usd: f64,
    #[serde(default)]
    pub require_wallet_match: bool,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            chains: default_chains(),
            min_price_usd: 0.0,
            min_liquidity_usd: 0.0,
            require_wallet_match: false,
        }
    }
}

impl FilterRules {
    /// Parse the configured network ids
    pub fn allowed_chains(&self) -> Result<HashSet<Chain>> {
        self.chains
            .iter()
            .map(|id| {
                Chain::parse(id).with_context(|| format!("Unknown chain in filters: {}", id))
            })
            .collect()
    }
}

/// A wallet whose activity the user cares about, from configuration.
/// Read-only for the lifetime of the monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchedWallet {
    pub chain: Chain,
    pub address: String,
    #[serde(default)]
    pub label: String,
}

impl WatchedWallet {
    /// Apply the chain's address normalization so configured wallets
    /// compare cleanly against extracted candidates
    pub fn normalized(mut self) -> Self {
        if self.chain.is_hex_style() {
            self.address = self.address.to_lowercase();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSettings {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_sink_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_secs: default_sink_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_scan_bytes")]
    pub max_scan_bytes: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_scan_bytes: default_max_scan_bytes(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    0 // Infinite
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_cache_file() -> String {
    "data/token_cache.json".to_string()
}

fn default_update_interval_secs() -> u64 {
    600
}

fn default_chains() -> Vec<String> {
    vec!["ethereum".to_string(), "solana".to_string()]
}

fn default_sink_timeout_secs() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    8
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_scan_bytes() -> usize {
    16 * 1024
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TOKENWATCH_)
            .add_source(
                config::Environment::with_prefix("TOKENWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.gateway.ws_url.is_empty() {
            anyhow::bail!("gateway.ws_url is required");
        }
        if !self.gateway.ws_url.starts_with("ws://") && !self.gateway.ws_url.starts_with("wss://") {
            anyhow::bail!("gateway.ws_url must be a ws:// or wss:// URL");
        }
        if self.gateway.channels.is_empty() {
            anyhow::bail!("gateway.channels must list at least one channel");
        }
        if self.gateway.queue_capacity == 0 {
            anyhow::bail!("gateway.queue_capacity must be at least 1");
        }

        if self.cache.update_interval_secs < 10 {
            anyhow::bail!("cache.update_interval_secs must be at least 10");
        }

        let allowed = self.filters.allowed_chains()?;
        if allowed.is_empty() {
            anyhow::bail!("filters.chains must list at least one chain");
        }
        if self.filters.min_price_usd < 0.0 || self.filters.min_liquidity_usd < 0.0 {
            anyhow::bail!("filter thresholds must not be negative");
        }
        if self.filters.require_wallet_match && self.wallets.is_empty() {
            anyhow::bail!("filters.require_wallet_match needs at least one configured wallet");
        }

        if self.sink.webhook_url.is_empty() {
            anyhow::bail!("sink.webhook_url is required");
        }

        if self.monitor.max_in_flight == 0 {
            anyhow::bail!("monitor.max_in_flight must be at least 1");
        }
        if self.monitor.max_scan_bytes < 256 {
            anyhow::bail!("monitor.max_scan_bytes must be at least 256");
        }

        Ok(())
    }

    /// Copy with secrets replaced, for display
    pub fn masked(&self) -> Config {
        let mut masked = self.clone();
        if !masked.sink.webhook_url.is_empty() {
            masked.sink.webhook_url = "***".to_string();
        }
        masked
    }
}
