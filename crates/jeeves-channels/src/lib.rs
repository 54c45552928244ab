//! `jeeves-channels` — the outbound delivery seam.
//!
//! The chat transport itself (ingestion, chunking, media) lives outside this
//! workspace; the scheduler and heartbeat only need a way to push text at a
//! recipient, which is this trait.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Errors a channel adapter can surface to the core.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// One-way delivery to an external messaging surface.
///
/// Implementations must be `Send + Sync`; `send` takes `&self` so a
/// connected adapter can deliver from multiple tasks.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`), used in logs.
    fn name(&self) -> &str;

    /// Deliver `text` to the platform-native recipient `channel_id`.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// Sink that logs and discards. Used when no transport is configured so
/// scheduled replies are still observable in the daemon log.
pub struct NullChannel;

#[async_trait]
impl OutboundChannel for NullChannel {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        info!(channel_id, chars = text.len(), "dropping outbound message (no channel configured)");
        Ok(())
    }
}
