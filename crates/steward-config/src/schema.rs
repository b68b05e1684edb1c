use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub channels: ChannelsConfig,
    pub providers: ProvidersConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Named model tiers. Must contain at least a "default" entry.
    /// A "summarization" tier is used for context compaction when present.
    pub models: HashMap<String, ModelRef>,
    pub retry: RetryConfig,
}

/// Reference to a provider + model combination for a named tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Model-call rounds allowed per user message.
    pub max_steps: u32,
    pub max_parallel_tools: usize,
    /// Approximate token budget for the history sent on each model call.
    pub context_budget_tokens: usize,
    /// Forward text fragments as they arrive. Only takes effect with
    /// providers that stream; the rig-backed providers answer in one piece.
    pub stream: bool,
    /// Cancel the in-flight cycle when a new message arrives on the same conversation.
    pub supersede_in_flight: bool,
    /// Wall-clock limit for one user-message cycle. 0 disables it.
    pub cycle_timeout_secs: u64,
    pub max_consecutive_tool_failures: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tokens: 8192,
            temperature: 0.7,
            max_steps: 8,
            max_parallel_tools: 4,
            context_budget_tokens: 100_000,
            stream: false,
            supersede_in_flight: false,
            cycle_timeout_secs: 300,
            max_consecutive_tool_failures: 3,
        }
    }
}

/// Backoff settings for provider calls. Tool calls use `tool_max_attempts`
/// with the same delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub tool_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
            tool_max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WebConfig {
    pub enabled: bool,
    /// Optional shared secret required as `?password=` on the websocket and the JSON API.
    pub password: Option<String>,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub ollama: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
    pub groq: Option<ProviderConfig>,
    pub gemini: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Conversations idle for longer than this are evicted from memory.
    pub idle_eviction_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 18790,
            idle_eviction_secs: 6 * 3600,
        }
    }
}
