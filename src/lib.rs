//! Token Mention Watcher Library
//!
//! Watches chat channels for token contract addresses, enriches every
//! mention with live market data and pushes qualifying alerts to a
//! webhook sink.

pub mod cache;
pub mod config;
pub mod dexscreener;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod monitor;
pub mod notify;
pub mod price;
pub mod stream;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
