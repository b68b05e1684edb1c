//! Per-cycle loop state and outcomes.

use std::fmt;

use tracing::debug;

use crate::context::ContextError;
use crate::provider::ProviderError;
use crate::turn::ToolCallRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingModel,
    ModelAnswered,
    ModelRequestedTools,
    AwaitingToolResults,
    Finalized,
    Failed,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingModel => "awaiting_model",
            Self::ModelAnswered => "model_answered",
            Self::ModelRequestedTools => "model_requested_tools",
            Self::AwaitingToolResults => "awaiting_tool_results",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a cycle ended without an answer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoopFailure {
    #[error("step budget of {max_steps} model calls exhausted")]
    StepBudgetExceeded { max_steps: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(ProviderError),
    #[error("provider still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },
    #[error("context needs {required} tokens, budget is {budget}")]
    ContextOverflow { required: usize, budget: usize },
    #[error("every tool call failed for {rounds} consecutive rounds: {last_error}")]
    ToolFailureLimit { rounds: u32, last_error: String },
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl LoopFailure {
    /// Text delivered to the user when the cycle fails.
    pub fn user_message(&self) -> String {
        match self {
            Self::StepBudgetExceeded { .. } => {
                "I've been working on this but reached the maximum number of steps \
                 without a final answer. Could you narrow the request down?"
                    .into()
            }
            Self::Cancelled => "Stopped before finishing.".into(),
            Self::Provider(_) | Self::RetriesExhausted { .. } => {
                "Sorry, the model is not reachable right now. Please try again shortly.".into()
            }
            Self::ContextOverflow { .. } => {
                "This conversation no longer fits in the model's context, even after \
                 summarizing. Please start a new conversation."
                    .into()
            }
            Self::ToolFailureLimit { last_error, .. } => format!(
                "I'm having trouble using a tool correctly and had to stop retrying. \
                 Last error: {last_error}. Could you try rephrasing your request?"
            ),
            Self::Context(_) => "Sorry, something went wrong while handling your message.".into(),
        }
    }
}

/// Transient state of one cycle. Owned by the loop, never stored.
#[derive(Debug)]
pub struct LoopState {
    pub remaining_steps: u32,
    pub pending_tool_calls: Vec<ToolCallRequest>,
    pub last_error: Option<String>,
    pub phase: LoopPhase,
    /// True once the one summarization retry for an overflow was spent.
    pub summarized: bool,
    pub rounds: u32,
    pub tool_invocations: usize,
    pub failed_tool_rounds: u32,
}

impl LoopState {
    pub fn new(max_steps: u32) -> Self {
        Self {
            remaining_steps: max_steps,
            pending_tool_calls: Vec::new(),
            last_error: None,
            phase: LoopPhase::AwaitingModel,
            summarized: false,
            rounds: 0,
            tool_invocations: 0,
            failed_tool_rounds: 0,
        }
    }

    pub fn transition(&mut self, next: LoopPhase) {
        debug!("phase {} -> {next}", self.phase);
        self.phase = next;
    }
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Finalized {
        text: String,
        /// Model calls made.
        rounds: u32,
        tool_invocations: usize,
    },
    Failed {
        failure: LoopFailure,
        rounds: u32,
    },
}

impl CycleOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Finalized { text, .. } => Some(text),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&LoopFailure> {
        match self {
            Self::Finalized { .. } => None,
            Self::Failed { failure, .. } => Some(failure),
        }
    }

    pub fn rounds(&self) -> u32 {
        match self {
            Self::Finalized { rounds, .. } | Self::Failed { rounds, .. } => *rounds,
        }
    }
}
