use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::turn::ConversationKey;

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.channel, &self.chat_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// The finished answer of a cycle.
    Final,
    /// A streamed text fragment; a `Final` message always follows.
    Partial,
    /// User-visible failure notice ending a cycle.
    Error,
    /// Fragments streamed so far belong to a failed attempt and should be
    /// discarded; a new stream or the final answer follows.
    Reset,
}

/// Message to send to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub kind: OutboundKind,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(key: &ConversationKey, kind: OutboundKind, content: impl Into<String>) -> Self {
        Self {
            channel: key.channel.clone(),
            chat_id: key.chat_id.clone(),
            content: content.into(),
            kind,
            metadata: HashMap::new(),
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.channel, &self.chat_id)
    }
}

/// Where the agent loop sends what it has to say.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn deliver(&self, key: &ConversationKey, message: OutboundMessage);

    /// Streamed fragment, delivered in emission order before the final message.
    async fn deliver_partial(&self, key: &ConversationKey, fragment: &str);

    /// Drop fragments already delivered for the current attempt.
    async fn discard_partials(&self, key: &ConversationKey);
}

/// Async message bus connecting channels to the agent.
pub struct MessageBus {
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub inbound_rx: mpsc::Receiver<InboundMessage>,
    pub outbound_tx: broadcast::Sender<OutboundMessage>,
}

impl MessageBus {
    pub fn new(buffer: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, _) = broadcast::channel(buffer);
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
        }
    }

    /// Adapter publishing the agent's output on this bus.
    pub fn outbound(&self) -> BusOutbound {
        BusOutbound {
            tx: self.outbound_tx.clone(),
        }
    }
}

/// [`ChannelAdapter`] that forwards onto the outbound broadcast channel.
#[derive(Clone)]
pub struct BusOutbound {
    tx: broadcast::Sender<OutboundMessage>,
}

impl BusOutbound {
    pub fn new(tx: broadcast::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChannelAdapter for BusOutbound {
    async fn deliver(&self, key: &ConversationKey, message: OutboundMessage) {
        if self.tx.send(message).is_err() {
            warn!("[{key}] no outbound subscribers, message dropped");
        }
    }

    async fn deliver_partial(&self, key: &ConversationKey, fragment: &str) {
        let msg = OutboundMessage::new(key, OutboundKind::Partial, fragment);
        // Partials are best effort.
        let _ = self.tx.send(msg);
    }

    async fn discard_partials(&self, key: &ConversationKey) {
        let _ = self
            .tx
            .send(OutboundMessage::new(key, OutboundKind::Reset, ""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_key_combines_channel_and_chat() {
        let msg = InboundMessage {
            channel: "web".into(),
            sender_id: "u1".into(),
            chat_id: "abc".into(),
            content: "hi".into(),
            media: vec![],
            metadata: HashMap::new(),
        };
        assert_eq!(msg.key().to_string(), "web:abc");
    }

    #[tokio::test]
    async fn bus_outbound_reaches_subscribers_in_order() {
        let bus = MessageBus::new(8);
        let mut rx = bus.outbound_tx.subscribe();
        let out = bus.outbound();
        let key = ConversationKey::new("web", "1");

        out.deliver_partial(&key, "He").await;
        out.discard_partials(&key).await;
        out.deliver_partial(&key, "Hel").await;
        out.deliver_partial(&key, "lo").await;
        out.deliver(&key, OutboundMessage::new(&key, OutboundKind::Final, "Hello"))
            .await;

        let kinds: Vec<(OutboundKind, String)> = (0..5)
            .map(|_| {
                let m = rx.try_recv().unwrap();
                (m.kind, m.content)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (OutboundKind::Partial, "He".to_string()),
                (OutboundKind::Reset, String::new()),
                (OutboundKind::Partial, "Hel".to_string()),
                (OutboundKind::Partial, "lo".to_string()),
                (OutboundKind::Final, "Hello".to_string()),
            ]
        );
    }

    #[test]
    fn outbound_kind_serializes_snake_case() {
        let key = ConversationKey::new("web", "1");
        let json = serde_json::to_value(OutboundMessage::new(&key, OutboundKind::Error, "x")).unwrap();
        assert_eq!(json["kind"], "error");
    }
}
