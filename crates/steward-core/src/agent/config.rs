use std::time::Duration;

use super::retry::RetryPolicy;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools \
when they help you answer accurately, and reply concisely.";

/// Explicit settings for an [`AgentLoop`](super::AgentLoop).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Model-call rounds per user message.
    pub max_steps: u32,
    pub max_parallel_tools: usize,
    pub context_budget_tokens: usize,
    pub max_tokens: u64,
    pub temperature: f64,
    /// Forward text fragments to the channel when the provider streams
    /// (`Provider::supports_streaming`); otherwise ignored.
    pub stream: bool,
    /// A new message on a busy conversation cancels the running cycle.
    pub supersede_in_flight: bool,
    pub cycle_timeout: Option<Duration>,
    /// Consecutive rounds in which every tool call failed before giving up.
    pub max_consecutive_tool_failures: u32,
    pub retry: RetryPolicy,
    pub tool_retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 8,
            max_parallel_tools: 4,
            context_budget_tokens: 100_000,
            max_tokens: 8192,
            temperature: 0.7,
            stream: false,
            supersede_in_flight: false,
            cycle_timeout: Some(Duration::from_secs(300)),
            max_consecutive_tool_failures: 3,
            retry: RetryPolicy::default(),
            tool_retry: RetryPolicy::none(),
        }
    }
}
