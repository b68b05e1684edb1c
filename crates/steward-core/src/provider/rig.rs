//! [`Provider`] backed by any `rig` completion model.

#[allow(deprecated)]
use ::rig::client::completion::CompletionModelHandle;
use ::rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use ::rig::message::{AssistantContent, Text, ToolResult, ToolResultContent, UserContent};
use ::rig::OneOrMany;
use async_trait::async_trait;
use tracing::debug;

use super::{ModelRequest, ModelTurn, Provider, ProviderError, StreamSink, Usage};
use crate::turn::{ToolCallRequest, Turn, TurnBody};

/// Adapts a rig completion model. Answers arrive in one piece, so streaming
/// is never offered and `agents.defaults.stream` has no effect here.
#[allow(deprecated)]
pub struct RigProvider {
    name: String,
    model: CompletionModelHandle<'static>,
}

#[allow(deprecated)]
impl RigProvider {
    /// `name` is used in logs, e.g. "anthropic/claude-sonnet-4".
    pub fn new(name: impl Into<String>, model: CompletionModelHandle<'static>) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }
}

#[async_trait]
#[allow(deprecated)]
impl Provider for RigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &ModelRequest,
        _stream: Option<&dyn StreamSink>,
    ) -> Result<ModelTurn, ProviderError> {
        let history = OneOrMany::many(to_messages(&request.turns))
            .map_err(|_| ProviderError::Fatal("empty conversation payload".into()))?;

        let tools = request
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let completion = CompletionRequest {
            preamble: Some(request.system_prompt.clone()).filter(|p| !p.is_empty()),
            chat_history: history,
            documents: Vec::new(),
            tools,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let response = self
            .model
            .completion(completion)
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        let mut turn = ModelTurn {
            usage: Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
            ..ModelTurn::default()
        };
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(t) => turn.text.push_str(&t.text),
                AssistantContent::ToolCall(tc) => turn.tool_calls.push(ToolCallRequest {
                    id: tc.id.clone(),
                    tool_name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                }),
                AssistantContent::Reasoning(r) => {
                    debug!("[{}] reasoning: {}", self.name, r.reasoning.join(" "));
                }
                _ => {}
            }
        }
        Ok(turn)
    }
}

fn user_text(text: String) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(Text { text })),
    }
}

fn with_attachments(text: &str, attachments: &[String]) -> String {
    let mut out = text.to_string();
    for path in attachments {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        out.push_str(&format!("\n[attachment: {path} ({mime})]"));
    }
    out
}

/// Convert sealed turns into rig messages.
///
/// Consecutive tool results are merged into one user message, which is the
/// shape every rig backend expects after an assistant tool-use turn.
fn to_messages(turns: &[Turn]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(turns.len());
    let mut results: Vec<UserContent> = Vec::new();

    let flush = |results: &mut Vec<UserContent>, messages: &mut Vec<Message>| {
        if let Ok(content) = OneOrMany::many(std::mem::take(results)) {
            messages.push(Message::User { content });
        }
    };

    for turn in turns {
        match turn.body() {
            TurnBody::ToolResult {
                tool_call_id,
                output,
                ok,
            } => {
                let text = if *ok {
                    output.clone()
                } else {
                    format!("Error: {output}")
                };
                results.push(UserContent::ToolResult(ToolResult {
                    id: tool_call_id.clone(),
                    call_id: None,
                    content: OneOrMany::one(ToolResultContent::Text(Text { text })),
                }));
                continue;
            }
            TurnBody::UserMessage { text, attachments } => {
                flush(&mut results, &mut messages);
                messages.push(user_text(with_attachments(text, attachments)));
            }
            TurnBody::AssistantMessage { text, tool_calls } => {
                flush(&mut results, &mut messages);
                let mut parts: Vec<AssistantContent> = Vec::new();
                if !text.is_empty() {
                    parts.push(AssistantContent::Text(Text { text: text.clone() }));
                }
                for call in tool_calls {
                    parts.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.tool_name.clone(),
                        call.arguments.clone(),
                    ));
                }
                let content = OneOrMany::many(parts).unwrap_or_else(|_| {
                    OneOrMany::one(AssistantContent::Text(Text {
                        text: String::new(),
                    }))
                });
                messages.push(Message::Assistant { id: None, content });
            }
            TurnBody::SystemNote { text } => {
                flush(&mut results, &mut messages);
                messages.push(user_text(format!("[system note] {text}")));
            }
        }
    }
    flush(&mut results, &mut messages);
    messages
}

/// Map a rig error message onto the retry taxonomy.
pub fn classify_error(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        return ProviderError::RateLimited(None);
    }
    let transient = [
        "500",
        "502",
        "503",
        "504",
        "529",
        "overloaded",
        "connection reset",
        "connection refused",
        "connection closed",
        "timed out",
        "timeout",
        "broken pipe",
        "temporarily unavailable",
    ];
    if transient.iter().any(|p| lower.contains(p)) {
        ProviderError::Transient(message.to_string())
    } else {
        ProviderError::Fatal(message.to_string())
    }
}
