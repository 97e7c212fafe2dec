//! Contract address extraction from raw channel text
//!
//! Each supported address family has its own shape pattern. Patterns
//! yield normalized candidates; anything that fails validation is
//! silently skipped so malformed text can never abort a message.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// EVM-style addresses: 0x + 40 hex chars
    static ref EVM_ADDRESS: Regex =
        Regex::new(r"\b0x[0-9a-fA-F]{40}\b").expect("static pattern");

    /// Solana-style addresses: base58 run of plausible length.
    /// Candidates still have to survive a bs58 decode to 32 bytes.
    static ref BASE58_ADDRESS: Regex =
        Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").expect("static pattern");
}

/// A blockchain network, identified by the lowercase id the price API uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Bsc,
    Base,
    Arbitrum,
    Polygon,
    Solana,
}

impl Chain {
    /// Lowercase network id as used by the price API and the config file
    pub fn id(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Bsc => "bsc",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Polygon => "polygon",
            Chain::Solana => "solana",
        }
    }

    /// Parse a network id; unknown networks return None
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "ethereum" => Some(Chain::Ethereum),
            "bsc" => Some(Chain::Bsc),
            "base" => Some(Chain::Base),
            "arbitrum" => Some(Chain::Arbitrum),
            "polygon" => Some(Chain::Polygon),
            "solana" => Some(Chain::Solana),
            _ => None,
        }
    }

    /// Whether addresses on this chain compare case-insensitively
    pub fn is_hex_style(&self) -> bool {
        !matches!(self, Chain::Solana)
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A normalized token contract address candidate
///
/// Hex-style addresses are lowercased so equality is case-insensitive;
/// base58 addresses keep their original casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractAddress {
    pub chain: Chain,
    pub address: String,
}

impl ContractAddress {
    pub fn new(chain: Chain, address: &str) -> Self {
        let address = if chain.is_hex_style() {
            address.to_lowercase()
        } else {
            address.to_string()
        };
        Self { chain, address }
    }
}

impl std::fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

/// Extracts contract address candidates from free-form message text
pub struct AddressExtractor {
    max_scan_bytes: usize,
}

impl AddressExtractor {
    pub fn new(max_scan_bytes: usize) -> Self {
        Self { max_scan_bytes }
    }

    /// Extract deduplicated candidates in first-seen order.
    ///
    /// Hex-shaped candidates default to Ethereum; the actual network is
    /// resolved later from the price source response. Base58 candidates
    /// must decode to a 32-byte key to qualify.
    pub fn extract(&self, text: &str) -> Vec<ContractAddress> {
        let text = self.clamp(text);

        let mut found: Vec<(usize, ContractAddress)> = Vec::new();

        for m in EVM_ADDRESS.find_iter(text) {
            found.push((m.start(), ContractAddress::new(Chain::Ethereum, m.as_str())));
        }

        for m in BASE58_ADDRESS.find_iter(text) {
            if !is_valid_base58_key(m.as_str()) {
                continue;
            }
            found.push((m.start(), ContractAddress::new(Chain::Solana, m.as_str())));
        }

        found.sort_by_key(|(start, _)| *start);

        let mut seen = std::collections::HashSet::new();
        found
            .into_iter()
            .filter_map(|(_, addr)| seen.insert(addr.clone()).then_some(addr))
            .collect()
    }

    /// Bound the scanned region of very long messages, respecting char
    /// boundaries
    fn clamp<'a>(&self, text: &'a str) -> &'a str {
        if text.len() <= self.max_scan_bytes {
            return text;
        }
        let mut end = self.max_scan_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}

fn is_valid_base58_key(candidate: &str) -> bool {
    match bs58::decode(candidate).into_vec() {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}
