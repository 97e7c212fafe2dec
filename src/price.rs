//! Token market-data model and the upstream price source seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extract::{Chain, ContractAddress};

/// Market snapshot for one token
///
/// Instances are immutable snapshots: the cache hands out copies, never
/// live references, so a concurrent refresh can't mutate data a caller
/// is mid-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Network the token actually trades on (resolved by the price
    /// source; may differ from the extraction default for hex addresses)
    pub chain: Chain,
    /// Normalized contract address
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub liquidity_usd: f64,
    pub last_updated: DateTime<Utc>,
    /// Derived from entry age, recomputed whenever a snapshot leaves the
    /// cache; the persisted value is informational only
    #[serde(default)]
    pub stale: bool,
}

/// Request/response lookup against the upstream market-data API.
///
/// Failures are typed via [`crate::Error`]: `TokenNotFound` for unknown
/// addresses, `RateLimited` for 429s, `Upstream` for transport problems.
/// None of them are fatal to callers; the pipeline treats each as
/// "could not identify token" for the affected address only.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Look up a single address
    async fn lookup(&self, address: &ContractAddress) -> Result<TokenInfo>;

    /// Look up a batch of addresses in as few requests as the API allows.
    /// Addresses the API does not know are simply missing from the
    /// result; that is not an error.
    async fn lookup_batch(&self, addresses: &[ContractAddress]) -> Result<Vec<TokenInfo>>;
}
