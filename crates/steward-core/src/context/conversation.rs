//! Per-conversation state owned by the context manager.

use std::time::Instant;

use tracing::{debug, warn};

use crate::context::cache::{self, CacheSegment, CacheToken, MAX_CACHE_SEGMENTS};
use crate::context::truncation;
use crate::context::{ContextError, Payload};
use crate::turn::{ConversationKey, ToolCallRequest, Turn, TurnBody};

#[derive(Debug)]
pub(crate) struct Conversation {
    key: ConversationKey,
    turns: Vec<Turn>,
    segments: Vec<CacheSegment>,
    next_seq: u64,
    /// Tool calls of the latest assistant turn still awaiting a result, in request order.
    open_calls: Vec<ToolCallRequest>,
    /// False once the current cycle is finalized; a user message reopens it.
    cycle_open: bool,
    /// Turns at or below this seq were folded into a summary note.
    compacted_through: Option<u64>,
    /// Hash chain of the most recent payload, used to anchor cache tokens.
    last_payload_chain: Vec<(u64, String)>,
    pub(crate) last_active: Instant,
}

impl Conversation {
    pub(crate) fn new(key: ConversationKey) -> Self {
        Self {
            key,
            turns: Vec::new(),
            segments: Vec::new(),
            next_seq: 1,
            open_calls: Vec::new(),
            cycle_open: false,
            compacted_through: None,
            last_payload_chain: Vec::new(),
            last_active: Instant::now(),
        }
    }

    pub(crate) fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub(crate) fn open_calls(&self) -> &[ToolCallRequest] {
        &self.open_calls
    }

    pub(crate) fn cycle_open(&self) -> bool {
        self.cycle_open
    }

    pub(crate) fn segments(&self) -> &[CacheSegment] {
        &self.segments
    }

    fn check_order(&self, body: &TurnBody) -> Result<(), ContextError> {
        let reject = |reason: String| Err(ContextError::InvalidTurnOrder(reason));
        match body {
            TurnBody::UserMessage { .. } => {
                if !self.open_calls.is_empty() {
                    return reject(format!(
                        "user message while {} tool call(s) are unanswered",
                        self.open_calls.len()
                    ));
                }
            }
            _ if !self.cycle_open => {
                return reject(format!(
                    "{} appended after the cycle was finalized",
                    body.kind()
                ));
            }
            TurnBody::AssistantMessage { .. } => {
                if !self.open_calls.is_empty() {
                    return reject(format!(
                        "assistant message while {} tool call(s) are unanswered",
                        self.open_calls.len()
                    ));
                }
            }
            TurnBody::ToolResult { tool_call_id, .. } => {
                if !self.open_calls.iter().any(|c| &c.id == tool_call_id) {
                    return reject(format!(
                        "tool result for '{tool_call_id}' matches no open tool call"
                    ));
                }
            }
            // Results must directly follow their request.
            TurnBody::SystemNote { .. } => {
                if !self.open_calls.is_empty() {
                    return reject(format!(
                        "system note while {} tool call(s) are unanswered",
                        self.open_calls.len()
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn append(&mut self, body: TurnBody, pinned: bool) -> Result<u64, ContextError> {
        self.check_order(&body)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        // Segments anchored at or beyond a newly written position can no longer
        // describe an unmodified prefix.
        let before = self.segments.len();
        self.segments.retain(|s| s.boundary_seq < seq);
        if self.segments.len() != before {
            warn!(
                "[{}] dropped {} cache segment(s) at or after seq {seq}",
                self.key,
                before - self.segments.len()
            );
        }

        match &body {
            TurnBody::UserMessage { .. } => self.cycle_open = true,
            TurnBody::AssistantMessage { tool_calls, .. } => {
                self.open_calls = tool_calls.clone();
            }
            TurnBody::ToolResult { tool_call_id, .. } => {
                self.open_calls.retain(|c| &c.id != tool_call_id);
            }
            TurnBody::SystemNote { .. } => {}
        }

        debug!("[{}] append #{seq} {}", self.key, body.kind());
        self.turns.push(Turn::seal(seq, body, pinned));
        self.last_active = Instant::now();
        Ok(seq)
    }

    pub(crate) fn finalize(&mut self) {
        self.cycle_open = false;
        self.last_active = Instant::now();
    }

    /// Turns eligible for the payload: everything after the compaction watermark.
    fn candidates(&self) -> &[Turn] {
        match self.compacted_through {
            Some(through) => {
                let start = self.turns.partition_point(|t| t.seq() <= through);
                &self.turns[start..]
            }
            None => &self.turns,
        }
    }

    pub(crate) fn build_payload(&mut self, budget: usize) -> Result<Payload, ContextError> {
        if !self.open_calls.is_empty() {
            return Err(ContextError::PendingToolCalls(
                self.open_calls.iter().map(|c| c.id.clone()).collect(),
            ));
        }

        let candidates = self.candidates();
        let selection = truncation::select(candidates, budget).map_err(|o| {
            ContextError::ContextOverflow {
                required: o.required,
                budget: o.budget,
            }
        })?;
        let turns: Vec<Turn> = selection
            .kept
            .iter()
            .map(|&i| candidates[i].clone())
            .collect();

        let chain = cache::prefix_chain(&turns);
        let segment = cache::longest_valid(&self.segments, &chain);
        let payload = Payload {
            cache_token: segment.map(|s| s.token.clone()),
            cache_boundary: segment.map(|s| s.boundary_seq),
            estimated_tokens: selection.estimated_tokens,
            dropped_turns: selection.dropped_turns,
            turns,
        };
        self.last_payload_chain = chain;
        Ok(payload)
    }

    /// Anchor `token` to the last payload's prefix ending at `boundary_seq`.
    /// Returns false when that boundary was not part of the last payload.
    pub(crate) fn record_cache_token(&mut self, boundary_seq: u64, token: CacheToken) -> bool {
        let Some((_, prefix_hash)) = self
            .last_payload_chain
            .iter()
            .find(|(seq, _)| *seq == boundary_seq)
        else {
            return false;
        };
        let segment = CacheSegment {
            boundary_seq,
            prefix_hash: prefix_hash.clone(),
            token,
        };
        self.segments.retain(|s| s.boundary_seq != boundary_seq);
        self.segments.push(segment);
        if self.segments.len() > MAX_CACHE_SEGMENTS {
            self.segments.remove(0);
        }
        true
    }

    /// Drop every turn with `seq >= from_seq`. Sequence numbers are not reused.
    pub(crate) fn rewind(&mut self, from_seq: u64) -> usize {
        let keep = self.turns.partition_point(|t| t.seq() < from_seq);
        let removed = self.turns.len() - keep;
        self.turns.truncate(keep);
        self.segments.retain(|s| s.boundary_seq < from_seq);
        self.last_payload_chain.retain(|(seq, _)| *seq < from_seq);
        if self.compacted_through.is_some_and(|c| c >= from_seq) {
            self.compacted_through = from_seq.checked_sub(1).filter(|c| *c > 0);
        }
        self.open_calls = self.reconstruct_open_calls();
        removed
    }

    fn reconstruct_open_calls(&self) -> Vec<ToolCallRequest> {
        let Some(pos) = self
            .turns
            .iter()
            .rposition(|t| !t.body().tool_calls().is_empty())
        else {
            return Vec::new();
        };
        let mut open = self.turns[pos].body().tool_calls().to_vec();
        for turn in &self.turns[pos + 1..] {
            if let TurnBody::ToolResult { tool_call_id, .. } = turn.body() {
                open.retain(|c| &c.id != tool_call_id);
            }
        }
        open
    }

    /// Turns a summary may replace: everything after the watermark that
    /// precedes the latest user message. Earlier notes and summaries are
    /// included, so each new summary supersedes the previous one.
    pub(crate) fn compaction_candidates(&self) -> Vec<Turn> {
        let candidates = self.candidates();
        let live_from = candidates
            .iter()
            .rposition(Turn::is_user)
            .unwrap_or(candidates.len());
        candidates[..live_from].to_vec()
    }

    pub(crate) fn compact(&mut self, through_seq: u64, summary: String) -> Result<u64, ContextError> {
        if self.compacted_through.is_some_and(|c| c >= through_seq) {
            return Err(ContextError::InvalidTurnOrder(format!(
                "already compacted through #{through_seq}"
            )));
        }
        let seq = self.append(TurnBody::note(summary), true)?;
        self.compacted_through = Some(through_seq);
        Ok(seq)
    }
}
