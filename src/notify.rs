//! Outbound notices

use crate::error::Result;
use async_trait::async_trait;

/// Destination for departure notices
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Post `text` to `channel_id`
    async fn post(&self, channel_id: u64, text: &str) -> Result<()>;
}

/// Sink that writes notices to the log, for offline runs
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn post(&self, channel_id: u64, text: &str) -> Result<()> {
        tracing::info!(channel = channel_id, "{}", text);
        println!("{}", text);
        Ok(())
    }
}
