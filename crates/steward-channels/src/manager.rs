//! Channel manager: owns the lifecycle of every registered channel and
//! routes the agent's outbound messages to them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use steward_core::bus::{InboundMessage, OutboundKind, OutboundMessage};

use crate::base::Channel;

type ChannelMap = Arc<RwLock<HashMap<String, Arc<dyn Channel>>>>;

/// Starts and stops channels and dispatches outbound messages by channel name.
pub struct ChannelManager {
    channels: ChannelMap,
    outbound_rx: Option<broadcast::Receiver<OutboundMessage>>,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl ChannelManager {
    pub fn new(outbound_rx: broadcast::Receiver<OutboundMessage>) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            outbound_rx: Some(outbound_rx),
            dispatch_handle: None,
        }
    }

    /// Register a channel. Must be called before `start_all()`.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!("Registered channel: {name}");
        self.channels.write().await.insert(name, channel);
    }

    /// Names of all registered channels, sorted.
    pub async fn enabled_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn every channel's `start()` and the outbound dispatcher.
    pub async fn start_all(&mut self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        for (name, channel) in self.channels.read().await.iter() {
            let ch = channel.clone();
            let tx = inbound_tx.clone();
            let ch_name = name.clone();
            tokio::spawn(async move {
                if let Err(e) = ch.start(tx).await {
                    error!("Channel {ch_name} failed: {e:#}");
                }
            });
        }

        if let Some(outbound_rx) = self.outbound_rx.take() {
            let channels = self.channels.clone();
            self.dispatch_handle = Some(tokio::spawn(dispatch_outbound(outbound_rx, channels)));
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) -> Result<()> {
        if let Some(handle) = self.dispatch_handle.take() {
            handle.abort();
            info!("Stopped outbound dispatcher");
        }

        for (name, channel) in self.channels.read().await.iter() {
            info!("Stopping channel: {name}");
            if let Err(e) = channel.stop().await {
                warn!("Error stopping channel {name}: {e:#}");
            }
        }
        Ok(())
    }
}

async fn dispatch_outbound(
    mut outbound_rx: broadcast::Receiver<OutboundMessage>,
    channels: ChannelMap,
) {
    loop {
        match outbound_rx.recv().await {
            Ok(msg) => {
                let channels = channels.read().await;
                let Some(channel) = channels.get(&msg.channel) else {
                    if msg.channel != "cli" {
                        warn!("No channel registered for: {}", msg.channel);
                    }
                    continue;
                };
                let result = match msg.kind {
                    OutboundKind::Partial | OutboundKind::Reset => {
                        channel.send_partial(&msg).await
                    }
                    OutboundKind::Final | OutboundKind::Error => channel.send(&msg).await,
                };
                if let Err(e) = result {
                    error!("Error sending to channel {}: {e:#}", msg.channel);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Outbound dispatcher lagged, missed {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Outbound channel closed, dispatcher shutting down");
                break;
            }
        }
    }
}
