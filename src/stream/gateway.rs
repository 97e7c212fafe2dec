//! WebSocket gateway client for channel messages
//!
//! Connects to the messaging platform's streaming gateway, subscribes
//! to the configured channel ids and forwards every message event into
//! a bounded queue. Reconnects on drop with a configurable attempt cap.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::stream::{ChannelMessage, MessageSource};

/// Configuration for the gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL of the streaming gateway
    pub ws_url: String,
    /// Channel ids to subscribe to
    pub channels: Vec<String>,
    /// Reconnect delay in milliseconds
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// Ping interval in seconds
    pub ping_interval_secs: u64,
    /// Capacity of the delivered-message queue
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            channels: Vec::new(),
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0, // Infinite
            ping_interval_secs: 30,
            queue_capacity: 1024,
        }
    }
}

/// Subscription request frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    method: String,
    channels: Vec<String>,
}

impl SubscribeRequest {
    fn subscribe(channels: Vec<String>) -> Self {
        Self {
            method: "subscribe".to_string(),
            channels,
        }
    }
}

/// Incoming message frame from the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageFrame {
    channel_id: String,
    message_id: String,
    text: String,
}

impl From<MessageFrame> for ChannelMessage {
    fn from(frame: MessageFrame) -> Self {
        Self {
            channel_id: frame.channel_id,
            message_id: frame.message_id,
            text: frame.text,
            received_at: chrono::Utc::now(),
        }
    }
}

/// WebSocket-backed [`MessageSource`]
pub struct GatewayClient {
    config: GatewayConfig,
    shutdown: broadcast::Sender<()>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self { config, shutdown }
    }

    /// Connect once and pump frames into the queue until the socket
    /// drops or shutdown is signalled. Returns Ok on clean close.
    async fn connect_and_stream(
        config: &GatewayConfig,
        event_tx: &mpsc::Sender<ChannelMessage>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        info!("Connecting to gateway at {}", config.ws_url);

        let url = url::Url::parse(&config.ws_url)
            .map_err(|e| Error::Config(format!("Invalid gateway URL: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::GatewayConnection(format!("WebSocket connect failed: {}", e)))?;

        info!("Connected to gateway");
        let (mut write, mut read) = ws_stream.split();

        if !config.channels.is_empty() {
            let request = SubscribeRequest::subscribe(config.channels.clone());
            let json = serde_json::to_string(&request)?;
            write
                .send(Message::Text(json))
                .await
                .map_err(|e| Error::GatewayConnection(format!("Failed to subscribe: {}", e)))?;
            info!("Subscribed to {} channel(s)", config.channels.len());
        }

        let mut ping_timer = tokio::time::interval(Duration::from_secs(config.ping_interval_secs));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Gateway stream shutting down");
                    return Ok(());
                }

                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        error!("Failed to send ping: {}", e);
                        break;
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_frame(&text, event_tx).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Gateway closed the connection");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("Gateway socket error: {}", e);
                            break;
                        }
                        None => {
                            info!("Gateway stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        Err(Error::GatewayDisconnected)
    }

    /// Parse one incoming frame; unknown frame shapes are ignored
    async fn handle_frame(text: &str, event_tx: &mpsc::Sender<ChannelMessage>) {
        match serde_json::from_str::<MessageFrame>(text) {
            Ok(frame) => {
                let message = ChannelMessage::from(frame);
                debug!(
                    channel = %message.channel_id,
                    message = %message.message_id,
                    "Gateway message"
                );
                if event_tx.send(message).await.is_err() {
                    debug!("Message queue receiver dropped");
                }
            }
            Err(_) => {
                debug!("Ignoring unknown frame: {}", &text[..text.len().min(100)]);
            }
        }
    }
}

#[async_trait]
impl MessageSource for GatewayClient {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut reconnect_attempts = 0u32;

            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("Gateway client shutting down");
                    break;
                }

                match Self::connect_and_stream(&config, &tx, &mut shutdown_rx).await {
                    Ok(_) => {
                        // Clean shutdown
                        break;
                    }
                    Err(e) => {
                        error!("Gateway stream error: {}", e);
                        reconnect_attempts += 1;

                        if config.max_reconnect_attempts > 0
                            && reconnect_attempts >= config.max_reconnect_attempts
                        {
                            error!(
                                "Max reconnect attempts ({}) reached",
                                config.max_reconnect_attempts
                            );
                            break;
                        }
                    }
                }

                let delay = Duration::from_millis(config.reconnect_delay_ms);
                warn!("Reconnecting in {:?}...", delay);
                sleep(delay).await;
            }
        });

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        Ok(())
    }
}
