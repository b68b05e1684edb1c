//! Writes agent output to a terminal (or any writer) for the interactive CLI.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use steward_core::bus::{ChannelAdapter, OutboundKind, OutboundMessage};
use steward_core::turn::ConversationKey;

type Renderer = Box<dyn Fn(&str) -> String + Send + Sync>;

pub struct TerminalChannel {
    out: Mutex<Box<dyn Write + Send>>,
    render: Renderer,
    /// Set while streamed fragments are on the current line.
    streaming: AtomicBool,
}

impl TerminalChannel {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            render: Box::new(|text| format!("{text}\n")),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Format final answers with `render` (e.g. markdown to ANSI).
    pub fn with_renderer(mut self, render: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.render = Box::new(render);
        self
    }

    /// Printed fragments cannot be taken back; the abandoned line is marked
    /// and the next stream starts on a fresh one.
    fn end_stream(&self, streamed: bool) {
        if streamed {
            self.write(" [retrying]\n");
        }
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            warn!("terminal write failed: {e}");
        }
    }
}

#[async_trait]
impl ChannelAdapter for TerminalChannel {
    async fn deliver(&self, _key: &ConversationKey, message: OutboundMessage) {
        let streamed = self.streaming.swap(false, Ordering::SeqCst);
        match message.kind {
            // The text is already on screen.
            OutboundKind::Final if streamed => self.write("\n"),
            OutboundKind::Final | OutboundKind::Partial => {
                let rendered = (self.render)(&message.content);
                self.write(&rendered);
            }
            OutboundKind::Error => {
                if streamed {
                    self.write("\n");
                }
                self.write(&format!("Error: {}\n", message.content));
            }
            OutboundKind::Reset => self.end_stream(streamed),
        }
    }

    async fn deliver_partial(&self, _key: &ConversationKey, fragment: &str) {
        self.streaming.store(true, Ordering::SeqCst);
        self.write(fragment);
    }

    async fn discard_partials(&self, _key: &ConversationKey) {
        let streamed = self.streaming.swap(false, Ordering::SeqCst);
        self.end_stream(streamed);
    }
}
