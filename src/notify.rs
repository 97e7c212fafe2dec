//! Alert formatting and delivery
//!
//! Alerts are immutable snapshots built once per qualifying address.
//! Delivery is fire-and-forget from the pipeline's point of view: a
//! failed send is logged and dropped, retries are the sink's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::WatchedWallet;
use crate::error::{Error, Result};
use crate::price::TokenInfo;
use crate::stream::ChannelMessage;

/// A qualifying token mention, ready for delivery
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub message: ChannelMessage,
    pub token: TokenInfo,
    pub matched_wallets: Vec<WatchedWallet>,
    pub created_at: DateTime<Utc>,
}

/// Outbound notification channel
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, alert: &AlertEvent) -> Result<()>;
}

/// Render an alert as the text body sent to the sink
pub fn format_alert(alert: &AlertEvent) -> String {
    let token = &alert.token;
    let mut lines = vec![
        format!("{} ({}) on {}", token.symbol, token.name, token.chain),
        format!(
            "price ${} | mcap {} | 24h vol {} | liq {}",
            token.price_usd,
            fmt_usd(token.market_cap),
            fmt_usd(token.volume_24h),
            fmt_usd(token.liquidity_usd),
        ),
        format!("address: {}", token.address),
        format!(
            "seen in channel {} (message {})",
            alert.message.channel_id, alert.message.message_id
        ),
    ];

    if token.stale {
        lines.push("note: cached data is stale".to_string());
    }

    if !alert.matched_wallets.is_empty() {
        let wallets = alert
            .matched_wallets
            .iter()
            .map(|w| {
                if w.label.is_empty() {
                    w.address.clone()
                } else {
                    format!("{} ({})", w.label, w.address)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("wallets: {}", wallets));
    }

    lines.join("\n")
}

/// Compact USD amount: $1.2M, $45.0K, $910
fn fmt_usd(value: f64) -> String {
    if value >= 1_000_000.0 {
        format!("${:.1}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("${:.1}K", value / 1_000.0)
    } else {
        format!("${:.0}", value)
    }
}

/// Webhook sink posting a text payload (Lark/Feishu-style body)
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, alert: &AlertEvent) -> Result<()> {
        let body = serde_json::json!({
            "msg_type": "text",
            "content": { "text": format_alert(alert) },
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::SinkDelivery(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::SinkDelivery(format!("status {}", resp.status())));
        }
        Ok(())
    }
}

/// Sink for dry runs: logs the alert instead of posting it
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, alert: &AlertEvent) -> Result<()> {
        info!("ALERT\n{}", format_alert(alert));
        Ok(())
    }
}
