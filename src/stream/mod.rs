//! Message stream plumbing
//!
//! The monitor consumes messages through the [`MessageSource`] seam;
//! the concrete WebSocket gateway lives in [`gateway`].

pub mod gateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;

/// A single message observed in a monitored channel.
///
/// Created by the source, consumed exactly once by the monitor.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub message_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Asynchronous source of channel messages.
///
/// Connection, auth and channel subscription mechanics are entirely the
/// implementation's concern; the pipeline only sees the event queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Begin delivering messages for the configured channels.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>>;

    /// Tear down the connection. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;
}
