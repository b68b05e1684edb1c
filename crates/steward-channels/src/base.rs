use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use steward_core::bus::{InboundMessage, OutboundMessage};

/// Trait that all chat channel implementations must satisfy.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "web"). Outbound messages are routed by it.
    fn name(&self) -> &str;

    /// Start listening for messages. Sends inbound messages through the provided sender.
    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Stop the channel and clean up resources.
    async fn stop(&self) -> Result<()>;

    /// Send a final answer or an error notice.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Send a streamed fragment, or a `Reset` voiding the fragments sent so far.
    /// Channels that cannot render partial output ignore both.
    async fn send_partial(&self, _msg: &OutboundMessage) -> Result<()> {
        Ok(())
    }

    /// Check if a sender is allowed to use this bot.
    fn is_allowed(&self, sender_id: &str) -> bool;
}
