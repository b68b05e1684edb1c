//! Model provider seam: request/response types, errors and the tier pool.

pub mod rig;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::CacheToken;
use crate::tools::ToolSchema;
use crate::turn::{ToolCallRequest, Turn};

pub use self::rig::RigProvider;

/// Everything a provider needs for one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub turns: Vec<Turn>,
    pub cache_token: Option<CacheToken>,
    /// Sorted by name.
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token covering the request's turns, if the provider issues one.
    pub cache_token: Option<CacheToken>,
    pub usage: Usage,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn tools(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("rate limited{}", .0.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited(Option<Duration>),
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Receives streamed text fragments in emission order.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_text(&self, fragment: &str);

    /// Called when an attempt fails after streaming; its fragments are void.
    async fn reset(&self) {}
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Run one model call. Streaming providers push fragments to `stream`
    /// before returning the complete turn.
    async fn generate(
        &self,
        request: &ModelRequest,
        stream: Option<&dyn StreamSink>,
    ) -> Result<ModelTurn, ProviderError>;
}

/// Named provider tiers ("default", "summarization", ...).
///
/// Unknown tiers fall back to "default", which is always present.
#[derive(Clone)]
pub struct ProviderPool {
    default: Arc<dyn Provider>,
    tiers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderPool {
    pub const DEFAULT: &'static str = "default";
    pub const SUMMARIZATION: &'static str = "summarization";

    pub fn new(default: Arc<dyn Provider>) -> Self {
        Self {
            default,
            tiers: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        let tier = tier.into();
        if tier == Self::DEFAULT {
            self.default = provider;
        } else {
            self.tiers.insert(tier, provider);
        }
        self
    }

    pub fn get(&self, tier: &str) -> &Arc<dyn Provider> {
        self.tiers.get(tier).unwrap_or(&self.default)
    }

    pub fn default_provider(&self) -> &Arc<dyn Provider> {
        &self.default
    }

    /// Configured tier names, "default" first.
    pub fn tiers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tiers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.insert(0, Self::DEFAULT);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Provider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn generate(
            &self,
            _request: &ModelRequest,
            _stream: Option<&dyn StreamSink>,
        ) -> Result<ModelTurn, ProviderError> {
            Ok(ModelTurn::text(self.0))
        }
    }

    #[test]
    fn unknown_tier_falls_back_to_default() {
        let pool = ProviderPool::new(Arc::new(Named("main")))
            .with_tier(ProviderPool::SUMMARIZATION, Arc::new(Named("cheap")));
        assert_eq!(pool.get("summarization").name(), "cheap");
        assert_eq!(pool.get("coding").name(), "main");
        assert_eq!(pool.tiers(), vec!["default", "summarization"]);
    }

    #[test]
    fn default_tier_can_be_replaced() {
        let pool = ProviderPool::new(Arc::new(Named("a"))).with_tier("default", Arc::new(Named("b")));
        assert_eq!(pool.default_provider().name(), "b");
        assert_eq!(pool.tiers(), vec!["default"]);
    }

    #[test]
    fn only_fatal_errors_are_final() {
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(ProviderError::RateLimited(None).is_retryable());
        assert!(!ProviderError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn rate_limited_display_includes_delay() {
        let err = ProviderError::RateLimited(Some(Duration::from_millis(1500)));
        assert_eq!(err.to_string(), "rate limited (retry after 1500ms)");
        assert_eq!(ProviderError::RateLimited(None).to_string(), "rate limited");
    }
}
