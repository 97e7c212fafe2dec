// DexScreener API client: the concrete upstream price source
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::{Chain, ContractAddress};
use crate::price::{PriceSource, TokenInfo};

const DEXSCREENER_BASE: &str = "https://api.dexscreener.com";

/// Maximum addresses per token-lookup request
const MAX_BATCH: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    #[serde(rename = "fdv")]
    pub fdv: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

pub struct DexScreenerClient {
    client: reqwest::Client,
}

impl DexScreenerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch pairs for up to [`MAX_BATCH`] addresses in one request.
    ///
    /// The endpoint is chain-agnostic: the returned pairs carry the
    /// network each token actually trades on.
    async fn get_token_pairs(&self, addresses: &[ContractAddress]) -> Result<Vec<DexPair>> {
        let joined = addresses
            .iter()
            .map(|a| a.address.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/latest/dex/tokens/{}", DEXSCREENER_BASE, joined);

        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!("status {}", resp.status())));
        }

        let data: TokenPairsResponse = resp.json().await?;
        Ok(data.pairs.unwrap_or_default())
    }
}

/// Pick the best snapshot for each queried address out of a pair list.
///
/// A token usually trades on several pairs; the one with the deepest USD
/// liquidity is the most trustworthy price. Pairs on networks we don't
/// recognize are skipped.
fn pairs_to_infos(addresses: &[ContractAddress], pairs: &[DexPair]) -> Vec<TokenInfo> {
    let mut infos = Vec::new();

    for queried in addresses {
        let best = pairs
            .iter()
            .filter(|p| address_matches(queried, &p.base_token.address))
            .filter(|p| Chain::parse(&p.chain_id).is_some())
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            });

        if let Some(pair) = best {
            infos.push(pair_to_info(queried, pair));
        }
    }

    infos
}

fn address_matches(queried: &ContractAddress, pair_address: &str) -> bool {
    if queried.chain.is_hex_style() {
        queried.address.eq_ignore_ascii_case(pair_address)
    } else {
        queried.address == pair_address
    }
}

fn pair_to_info(queried: &ContractAddress, pair: &DexPair) -> TokenInfo {
    let chain = Chain::parse(&pair.chain_id).unwrap_or(queried.chain);

    let price_usd = pair
        .price_usd
        .as_ref()
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0);

    TokenInfo {
        chain,
        address: queried.address.clone(),
        symbol: pair
            .base_token
            .symbol
            .clone()
            .unwrap_or_else(|| "???".to_string()),
        name: pair
            .base_token
            .name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string()),
        price_usd,
        market_cap: pair.market_cap.or(pair.fdv).unwrap_or(0.0),
        volume_24h: pair.volume.as_ref().and_then(|v| v.h24).unwrap_or(0.0),
        liquidity_usd: pair.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0),
        last_updated: chrono::Utc::now(),
        stale: false,
    }
}

#[async_trait::async_trait]
impl PriceSource for DexScreenerClient {
    async fn lookup(&self, address: &ContractAddress) -> Result<TokenInfo> {
        let pairs = self.get_token_pairs(std::slice::from_ref(address)).await?;
        pairs_to_infos(std::slice::from_ref(address), &pairs)
            .into_iter()
            .next()
            .ok_or_else(|| Error::TokenNotFound(address.to_string()))
    }

    async fn lookup_batch(&self, addresses: &[ContractAddress]) -> Result<Vec<TokenInfo>> {
        let mut infos = Vec::new();
        for chunk in addresses.chunks(MAX_BATCH) {
            let pairs = self.get_token_pairs(chunk).await?;
            debug!(queried = chunk.len(), pairs = pairs.len(), "Fetched pair batch");
            infos.extend(pairs_to_infos(chunk, &pairs));
        }
        Ok(infos)
    }
}

impl Default for DexScreenerClient {
    fn default() -> Self {
        Self::new()
    }
}
