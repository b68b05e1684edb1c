pub mod agent;
pub mod bus;
pub mod context;
pub mod provider;
pub mod tools;
pub mod turn;

// Re-export key types
pub use agent::{AgentConfig, AgentLoop, CycleOutcome, LoopFailure, RetryPolicy};
pub use context::{ContextError, ContextManager, Payload};
pub use provider::{ModelRequest, ModelTurn, Provider, ProviderError, ProviderPool, StreamSink};
pub use tools::{Tool, ToolError, ToolOutput, ToolRegistry};
pub use turn::{ConversationKey, ToolCallRequest, Turn, TurnBody};
