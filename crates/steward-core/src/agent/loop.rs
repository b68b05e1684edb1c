use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::AgentConfig;
use super::preview;
use super::state::{CycleOutcome, LoopFailure, LoopPhase, LoopState};
use super::summarize;
use crate::bus::{ChannelAdapter, OutboundKind, OutboundMessage};
use crate::context::{ContextError, ContextManager, Payload};
use crate::provider::{ModelRequest, ModelTurn, Provider, ProviderPool, StreamSink};
use crate::tools::{ToolError, ToolOutput, ToolRegistry};
use crate::turn::{ConversationKey, ToolCallRequest, TurnBody};

const EMPTY_ANSWER_FALLBACK: &str = "I've completed processing but have no response to give.";

/// One queued inbound message.
struct Job {
    text: String,
    attachments: Vec<String>,
    done: oneshot::Sender<CycleOutcome>,
}

/// Forwards streamed fragments to the channel until the cycle is cancelled.
struct ChannelStream<'a> {
    channel: &'a dyn ChannelAdapter,
    key: &'a ConversationKey,
    cancel: &'a CancellationToken,
    /// Fragments of the current attempt reached the channel.
    sent: AtomicBool,
}

impl<'a> ChannelStream<'a> {
    fn new(
        channel: &'a dyn ChannelAdapter,
        key: &'a ConversationKey,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            channel,
            key,
            cancel,
            sent: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<'a> StreamSink for ChannelStream<'a> {
    async fn on_text(&self, fragment: &str) {
        if !self.cancel.is_cancelled() {
            self.sent.store(true, Ordering::SeqCst);
            self.channel.deliver_partial(self.key, fragment).await;
        }
    }

    async fn reset(&self) {
        if self.sent.swap(false, Ordering::SeqCst) {
            self.channel.discard_partials(self.key).await;
        }
    }
}

/// Drives user messages through model calls and tool rounds.
///
/// Messages for one conversation are handled strictly in arrival order by a
/// per-key worker; different conversations run in parallel.
pub struct AgentLoop {
    context: Arc<ContextManager>,
    providers: ProviderPool,
    tools: Arc<ToolRegistry>,
    channel: Arc<dyn ChannelAdapter>,
    config: AgentConfig,
    workers: DashMap<ConversationKey, mpsc::UnboundedSender<Job>>,
    cancels: DashMap<ConversationKey, CancellationToken>,
}

impl AgentLoop {
    pub fn new(
        context: Arc<ContextManager>,
        providers: ProviderPool,
        tools: Arc<ToolRegistry>,
        channel: Arc<dyn ChannelAdapter>,
        config: AgentConfig,
    ) -> Self {
        Self {
            context,
            providers,
            tools,
            channel,
            config,
            workers: DashMap::new(),
            cancels: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Entry point for channels. Queues the message behind any cycle already
    /// running for `key`; the receiver resolves when its cycle ends.
    pub fn on_inbound_message(
        self: &Arc<Self>,
        key: ConversationKey,
        text: impl Into<String>,
        attachments: Vec<String>,
    ) -> oneshot::Receiver<CycleOutcome> {
        if self.config.supersede_in_flight && self.cancel(&key) {
            info!("[{key}] new message supersedes the running cycle");
        }

        let (done, rx) = oneshot::channel();
        let job = Job {
            text: text.into(),
            attachments,
            done,
        };

        let mut worker = self
            .workers
            .entry(key.clone())
            .or_insert_with(|| self.spawn_worker(key.clone()));
        if let Err(mpsc::error::SendError(job)) = worker.send(job) {
            debug!("[{key}] worker exited, starting a new one");
            let fresh = self.spawn_worker(key.clone());
            // A worker that was just spawned holds its receiver.
            let _ = fresh.send(job);
            *worker = fresh;
        }
        rx
    }

    fn spawn_worker(self: &Arc<Self>, key: ConversationKey) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let agent: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                let outcome = agent
                    .process_message(&key, &job.text, job.attachments)
                    .await;
                let _ = job.done.send(outcome);
            }
            debug!("[{key}] worker stopped");
        });
        tx
    }

    /// Cancel the cycle running for `key`. Returns false if none is running.
    pub fn cancel(&self, key: &ConversationKey) -> bool {
        match self.cancels.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Read-only copy of the conversation history.
    pub fn snapshot(&self, key: &ConversationKey) -> Vec<crate::turn::Turn> {
        self.context.snapshot(key)
    }

    /// Drop idle conversations and their workers.
    pub fn evict_idle(&self, max_idle: std::time::Duration) -> Vec<ConversationKey> {
        let evicted = self.context.evict_idle(max_idle);
        for key in &evicted {
            self.workers.remove(key);
        }
        evicted
    }

    /// Run one complete cycle for `text` and return how it ended.
    ///
    /// Waits for any cycle already holding `key`.
    pub async fn process_message(
        &self,
        key: &ConversationKey,
        text: &str,
        attachments: Vec<String>,
    ) -> CycleOutcome {
        let _cycle = self.context.begin_cycle(key).await;
        let span = info_span!("cycle", key = %key, id = %Uuid::new_v4());

        let cancel = CancellationToken::new();
        self.cancels.insert(key.clone(), cancel.clone());
        let timer = self.config.cycle_timeout.map(|limit| {
            let token = cancel.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("[{key}] cycle timed out after {}s", limit.as_secs());
                token.cancel();
            })
        });

        let outcome = self
            .run_cycle(key, text, attachments, &cancel)
            .instrument(span)
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        self.cancels.remove(key);
        outcome
    }

    async fn run_cycle(
        &self,
        key: &ConversationKey,
        text: &str,
        attachments: Vec<String>,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let mut state = LoopState::new(self.config.max_steps);
        info!("[{key}] user: {}", preview(text, 120));

        if let Err(e) = self.context.append(key, TurnBody::user(text, attachments)) {
            return self.fail(key, &mut state, e.into()).await;
        }

        loop {
            match self.round(key, &mut state, cancel).await {
                Ok(Some(text)) => {
                    return CycleOutcome::Finalized {
                        text,
                        rounds: state.rounds,
                        tool_invocations: state.tool_invocations,
                    };
                }
                Ok(None) => state.transition(LoopPhase::AwaitingModel),
                Err(failure) => return self.fail(key, &mut state, failure).await,
            }
        }
    }

    /// One model call plus the tools it requests. Returns the final text once
    /// the model answers without tools.
    async fn round(
        &self,
        key: &ConversationKey,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LoopFailure> {
        if cancel.is_cancelled() {
            return Err(LoopFailure::Cancelled);
        }
        if state.remaining_steps == 0 {
            return Err(LoopFailure::StepBudgetExceeded {
                max_steps: self.config.max_steps,
            });
        }
        state.remaining_steps -= 1;
        state.rounds += 1;

        let payload = self.payload(key, state, cancel).await?;
        let boundary = payload.last_seq();
        let request = ModelRequest {
            system_prompt: self.config.system_prompt.clone(),
            turns: payload.turns,
            cache_token: payload.cache_token,
            tools: self.tools.schemas(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        debug!(
            "LLM request [{}/{}]: {} turns, ~{} tokens",
            state.rounds,
            self.config.max_steps,
            request.turns.len(),
            payload.estimated_tokens
        );

        let provider = self.providers.default_provider();
        let stream = (self.config.stream && provider.supports_streaming())
            .then(|| ChannelStream::new(self.channel.as_ref(), key, cancel));
        let started = std::time::Instant::now();
        let turn = self
            .generate(
                provider.as_ref(),
                &request,
                stream.as_ref().map(|s| s as &dyn StreamSink),
                cancel,
            )
            .await?;
        // A result that raced the cancellation is discarded.
        if cancel.is_cancelled() {
            return Err(LoopFailure::Cancelled);
        }

        if let (Some(token), Some(boundary)) = (turn.cache_token.clone(), boundary) {
            self.context.record_cache_token(key, boundary, token);
        }

        if turn.tool_calls.is_empty() {
            state.transition(LoopPhase::ModelAnswered);
            let text = if turn.text.trim().is_empty() {
                EMPTY_ANSWER_FALLBACK.to_string()
            } else {
                turn.text
            };
            debug!(
                "LLM response [{}/{}]: text ({} chars) in {:.1}s",
                state.rounds,
                self.config.max_steps,
                text.len(),
                started.elapsed().as_secs_f64()
            );
            self.context.append(key, TurnBody::assistant(&text, Vec::new()))?;
            self.context.finalize(key);
            state.transition(LoopPhase::Finalized);
            self.channel
                .deliver(key, OutboundMessage::new(key, OutboundKind::Final, &text))
                .await;
            return Ok(Some(text));
        }

        state.transition(LoopPhase::ModelRequestedTools);
        let calls = unique_call_ids(turn.tool_calls);
        debug!(
            "LLM response [{}/{}]: {} tool call(s) in {:.1}s",
            state.rounds,
            self.config.max_steps,
            calls.len(),
            started.elapsed().as_secs_f64()
        );
        self.context
            .append(key, TurnBody::assistant(turn.text, calls.clone()))?;
        state.pending_tool_calls = calls.clone();
        state.transition(LoopPhase::AwaitingToolResults);
        self.run_tools(key, state, calls, cancel).await?;
        Ok(None)
    }

    /// Build the payload, spending the one summarization retry on overflow.
    async fn payload(
        &self,
        key: &ConversationKey,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<Payload, LoopFailure> {
        let budget = self.config.context_budget_tokens;
        match self.context.build_payload(key, budget) {
            Ok(payload) => Ok(payload),
            Err(ContextError::ContextOverflow { required, budget }) if !state.summarized => {
                state.summarized = true;
                warn!("[{key}] context overflow ({required} > {budget} tokens), summarizing");
                self.summarize(key, cancel).await.map_err(|failure| match failure {
                    LoopFailure::Cancelled => LoopFailure::Cancelled,
                    other => {
                        warn!("[{key}] summarization failed: {other}");
                        LoopFailure::ContextOverflow { required, budget }
                    }
                })?;
                self.context
                    .build_payload(key, budget)
                    .map_err(from_context_error)
            }
            Err(e) => Err(from_context_error(e)),
        }
    }

    async fn summarize(
        &self,
        key: &ConversationKey,
        cancel: &CancellationToken,
    ) -> Result<(), LoopFailure> {
        let candidates = self.context.compaction_candidates(key);
        let Some(through) = candidates.last().map(|t| t.seq()) else {
            return Err(LoopFailure::Context(ContextError::InvalidTurnOrder(
                "nothing left to summarize".into(),
            )));
        };

        let transcript =
            summarize::render_transcript(&candidates, self.config.context_budget_tokens * 2);
        let request = summarize::summary_request(transcript, self.config.max_tokens);
        let provider = self.providers.get(ProviderPool::SUMMARIZATION);
        let turn = self.generate(provider.as_ref(), &request, None, cancel).await?;
        if cancel.is_cancelled() {
            return Err(LoopFailure::Cancelled);
        }

        self.context
            .compact(key, through, summarize::summary_note(&turn.text))?;
        info!(
            "[{key}] folded {} turn(s) into a summary via {}",
            candidates.len(),
            provider.name()
        );
        Ok(())
    }

    /// Call `provider`, retrying per the policy, abandoning the call on cancel.
    async fn generate(
        &self,
        provider: &dyn Provider,
        request: &ModelRequest,
        stream: Option<&dyn StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, LoopFailure> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoopFailure::Cancelled),
                result = provider.generate(request, stream) => result,
            };
            let err = match result {
                Ok(turn) => return Ok(turn),
                Err(err) => err,
            };
            if let Some(stream) = stream {
                stream.reset().await;
            }

            let Some(delay) = policy.backoff(&err, attempt) else {
                return Err(if err.is_retryable() {
                    LoopFailure::RetriesExhausted {
                        attempts: attempt + 1,
                        last: err,
                    }
                } else {
                    LoopFailure::Provider(err)
                });
            };
            warn!(
                "{} call failed (attempt {}/{}): {err}; retrying in {}ms",
                provider.name(),
                attempt + 1,
                policy.max_attempts,
                delay.as_millis()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoopFailure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Invoke every requested tool, at most `max_parallel_tools` at a time, and
    /// append each result as it completes.
    async fn run_tools(
        &self,
        key: &ConversationKey,
        state: &mut LoopState,
        calls: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), LoopFailure> {
        let limit = self.config.max_parallel_tools.max(1);
        let mut pending = futures::stream::iter(calls.into_iter().map(|call| async move {
            let outcome = self.invoke_tool(&call).await;
            (call, outcome)
        }))
        .buffer_unordered(limit);

        let mut any_ok = false;
        let mut last_error = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoopFailure::Cancelled),
                next = pending.next() => next,
            };
            let Some((call, outcome)) = next else {
                break;
            };

            state.tool_invocations += 1;
            let (output, ok) = match outcome {
                Ok(out) => (out.content, true),
                Err(e) => (e.to_string(), false),
            };
            if ok {
                any_ok = true;
                debug!("Tool result [{}]: {}", call.tool_name, preview(&output, 200));
            } else {
                warn!("Tool {} failed: {output}", call.tool_name);
                last_error.clone_from(&output);
            }
            self.context
                .append(key, TurnBody::tool_result(&call.id, output, ok))?;
            state.pending_tool_calls.retain(|c| c.id != call.id);
        }

        if any_ok {
            state.failed_tool_rounds = 0;
        } else {
            state.failed_tool_rounds += 1;
            state.last_error = Some(last_error.clone());
            let limit = self.config.max_consecutive_tool_failures;
            if limit > 0 && state.failed_tool_rounds >= limit {
                warn!(
                    "Circuit breaker: {} consecutive rounds with all tool calls failing",
                    state.failed_tool_rounds
                );
                return Err(LoopFailure::ToolFailureLimit {
                    rounds: state.failed_tool_rounds,
                    last_error,
                });
            }
        }
        Ok(())
    }

    async fn invoke_tool(&self, call: &ToolCallRequest) -> Result<ToolOutput, ToolError> {
        info!(
            "Tool call: {}({})",
            call.tool_name,
            preview(&call.arguments.to_string(), 200)
        );
        let policy = &self.config.tool_retry;
        let mut attempt = 0;
        loop {
            match self
                .tools
                .invoke(&call.tool_name, call.arguments.clone())
                .await
            {
                Err(ToolError::ExecutionFailed(detail)) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        "Tool {} failed ({detail}), retrying in {}ms",
                        call.tool_name,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Terminal failure: close open calls, leave a note, tell the user.
    async fn fail(
        &self,
        key: &ConversationKey,
        state: &mut LoopState,
        failure: LoopFailure,
    ) -> CycleOutcome {
        state.transition(LoopPhase::Failed);
        state.last_error = Some(failure.to_string());
        warn!("[{key}] cycle failed after {} round(s): {failure}", state.rounds);

        for call in self.context.open_tool_calls(key) {
            let closed = TurnBody::tool_result(&call.id, format!("not executed: {failure}"), false);
            if let Err(e) = self.context.append(key, closed) {
                warn!("[{key}] could not close tool call {}: {e}", call.id);
            }
        }
        state.pending_tool_calls.clear();
        if let Err(e) = self
            .context
            .append(key, TurnBody::note(format!("Cycle failed: {failure}")))
        {
            warn!("[{key}] could not record failure note: {e}");
        }
        self.context.finalize(key);

        self.channel
            .deliver(
                key,
                OutboundMessage::new(key, OutboundKind::Error, failure.user_message()),
            )
            .await;
        CycleOutcome::Failed {
            failure,
            rounds: state.rounds,
        }
    }
}

fn from_context_error(e: ContextError) -> LoopFailure {
    match e {
        ContextError::ContextOverflow { required, budget } => {
            LoopFailure::ContextOverflow { required, budget }
        }
        other => LoopFailure::Context(other),
    }
}

/// Providers occasionally repeat or omit call ids; results are matched by id,
/// so each call in a round gets a distinct one.
fn unique_call_ids(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{}", Uuid::new_v4().simple());
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            tool_name: "calculator".into(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn duplicate_and_empty_ids_are_replaced() {
        let calls = unique_call_ids(vec![call("a"), call("a"), call(""), call("b")]);
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids[0], "a");
        assert_ne!(ids[1], "a");
        assert!(!ids[2].is_empty());
        assert_eq!(ids[3], "b");
        let distinct: std::collections::HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn overflow_maps_to_loop_failure() {
        let failure = from_context_error(ContextError::ContextOverflow {
            required: 10,
            budget: 5,
        });
        assert_eq!(
            failure,
            LoopFailure::ContextOverflow {
                required: 10,
                budget: 5
            }
        );
    }
}
