//! Conversation keys and sealed turns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of a conversation: the channel plus the chat/thread id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel: String,
    pub chat_id: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Parse `channel:chat_id`. A key without a colon is treated as a CLI chat id.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((channel, chat_id)) => Self::new(channel, chat_id),
            None => Self::new("cli", raw),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.chat_id)
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnBody {
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    AssistantMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        tool_call_id: String,
        output: String,
        ok: bool,
    },
    SystemNote {
        text: String,
    },
}

impl TurnBody {
    pub fn user(text: impl Into<String>, attachments: Vec<String>) -> Self {
        Self::UserMessage {
            text: text.into(),
            attachments,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::AssistantMessage {
            text: text.into(),
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>, ok: bool) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
            ok,
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::SystemNote { text: text.into() }
    }

    /// Tool calls carried by an assistant turn (empty for every other variant).
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            Self::AssistantMessage { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user",
            Self::AssistantMessage { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
            Self::SystemNote { .. } => "system_note",
        }
    }

    /// Approximate token cost: ceil(chars / 4) plus a fixed per-turn overhead.
    pub fn estimated_tokens(&self) -> usize {
        const PER_TURN_OVERHEAD: usize = 4;
        let chars = match self {
            Self::UserMessage { text, attachments } => {
                text.chars().count() + attachments.iter().map(|a| a.chars().count()).sum::<usize>()
            }
            Self::AssistantMessage { text, tool_calls } => {
                text.chars().count()
                    + tool_calls
                        .iter()
                        .map(|c| {
                            c.id.chars().count()
                                + c.tool_name.chars().count()
                                + c.arguments.to_string().chars().count()
                        })
                        .sum::<usize>()
            }
            Self::ToolResult {
                tool_call_id,
                output,
                ..
            } => tool_call_id.chars().count() + output.chars().count(),
            Self::SystemNote { text } => text.chars().count(),
        };
        chars.div_ceil(4) + PER_TURN_OVERHEAD
    }

    fn content_hash(&self) -> String {
        let canonical =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"));
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

/// A sealed, immutable unit of conversation history.
///
/// Turns are only created by the context manager, which assigns the
/// sequence number at append time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    seq: u64,
    created_at: DateTime<Utc>,
    pinned: bool,
    hash: String,
    #[serde(flatten)]
    body: TurnBody,
}

impl Turn {
    pub(crate) fn seal(seq: u64, body: TurnBody, pinned: bool) -> Self {
        let hash = body.content_hash();
        Self {
            seq,
            created_at: Utc::now(),
            pinned,
            hash,
            body,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Pinned turns are never dropped by truncation.
    pub fn pinned(&self) -> bool {
        self.pinned
    }

    /// SHA-256 of the body's canonical JSON.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn body(&self) -> &TurnBody {
        &self.body
    }

    pub fn estimated_tokens(&self) -> usize {
        self.body.estimated_tokens()
    }

    pub fn is_user(&self) -> bool {
        matches!(self.body, TurnBody::UserMessage { .. })
    }

    pub fn is_system_note(&self) -> bool {
        matches!(self.body, TurnBody::SystemNote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key = ConversationKey::new("web", "chat-1");
        assert_eq!(key.to_string(), "web:chat-1");
        assert_eq!(ConversationKey::parse("web:chat-1"), key);
    }

    #[test]
    fn key_without_channel_defaults_to_cli() {
        assert_eq!(
            ConversationKey::parse("interactive"),
            ConversationKey::new("cli", "interactive")
        );
    }

    #[test]
    fn key_keeps_colons_in_chat_id() {
        let key = ConversationKey::parse("slack:T1:C2");
        assert_eq!(key.channel, "slack");
        assert_eq!(key.chat_id, "T1:C2");
    }

    #[test]
    fn hash_depends_only_on_body() {
        let a = Turn::seal(1, TurnBody::user("hello", vec![]), false);
        let b = Turn::seal(7, TurnBody::user("hello", vec![]), true);
        let c = Turn::seal(1, TurnBody::user("hello!", vec![]), false);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(TurnBody::note("").estimated_tokens(), 4);
        assert_eq!(TurnBody::note("abc").estimated_tokens(), 5);
        assert_eq!(TurnBody::note("abcd").estimated_tokens(), 5);
        assert_eq!(TurnBody::note("abcde").estimated_tokens(), 6);
    }

    #[test]
    fn tool_calls_only_on_assistant_turns() {
        let call = ToolCallRequest {
            id: "c1".into(),
            tool_name: "calculator".into(),
            arguments: serde_json::json!({"expression": "2+2"}),
        };
        assert_eq!(TurnBody::assistant("", vec![call.clone()]).tool_calls(), &[call]);
        assert!(TurnBody::user("hi", vec![]).tool_calls().is_empty());
    }

    #[test]
    fn turn_serializes_flat() {
        let turn = Turn::seal(3, TurnBody::tool_result("c1", "4", true), false);
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_call_id"], "c1");
        assert_eq!(json["ok"], true);
    }
}
