//! Conversation history and payload construction.
//!
//! The [`ContextManager`] owns every conversation in a process-wide keyed
//! store. Each key has its own slot: a synchronous mutex for the in-memory
//! state and an async FIFO lock that admits one agent cycle at a time.

pub mod cache;
mod conversation;
pub mod truncation;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

pub use cache::{CacheSegment, CacheToken};
use conversation::Conversation;

use crate::turn::{ConversationKey, ToolCallRequest, Turn, TurnBody};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("invalid turn order: {0}")]
    InvalidTurnOrder(String),
    #[error("context overflow: {required} tokens required, budget is {budget}")]
    ContextOverflow { required: usize, budget: usize },
    #[error("tool calls still awaiting results: {}", .0.join(", "))]
    PendingToolCalls(Vec<String>),
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationKey),
}

/// The exact history for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub turns: Vec<Turn>,
    pub cache_token: Option<CacheToken>,
    /// Last seq covered by `cache_token`.
    pub cache_boundary: Option<u64>,
    pub estimated_tokens: usize,
    pub dropped_turns: usize,
}

impl Payload {
    pub fn last_seq(&self) -> Option<u64> {
        self.turns.last().map(Turn::seq)
    }
}

struct Slot {
    state: Mutex<Conversation>,
    cycle: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, Conversation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut state = self.state();
        f(&mut state)
    }
}

/// Exclusive right to run one cycle on a conversation. Released on drop.
pub struct CycleGuard {
    key: ConversationKey,
    _guard: OwnedMutexGuard<()>,
}

impl CycleGuard {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }
}

#[derive(Default)]
pub struct ContextManager {
    slots: DashMap<ConversationKey, Arc<Slot>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ConversationKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating conversation {key}");
                Arc::new(Slot {
                    state: Mutex::new(Conversation::new(key.clone())),
                    cycle: Arc::new(tokio::sync::Mutex::new(())),
                })
            })
            .value()
            .clone()
    }

    fn existing(&self, key: &ConversationKey) -> Option<Arc<Slot>> {
        self.slots.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Wait for exclusive access to `key`. Waiters are admitted in arrival order.
    pub async fn begin_cycle(&self, key: &ConversationKey) -> CycleGuard {
        let lock = self.slot(key).cycle.clone();
        CycleGuard {
            key: key.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Append a sealed turn and return its sequence number.
    pub fn append(&self, key: &ConversationKey, body: TurnBody) -> Result<u64, ContextError> {
        self.slot(key).with(|c| c.append(body, false))
    }

    /// Append a turn that truncation must never drop.
    pub fn append_pinned(&self, key: &ConversationKey, body: TurnBody) -> Result<u64, ContextError> {
        self.slot(key).with(|c| c.append(body, true))
    }

    /// Close the current cycle. Only a new user message may follow.
    pub fn finalize(&self, key: &ConversationKey) {
        if let Some(slot) = self.existing(key) {
            slot.with(Conversation::finalize);
        }
    }

    /// Build the history for the next model call within `max_tokens_budget`.
    ///
    /// Deterministic for a given stored state and budget.
    pub fn build_payload(
        &self,
        key: &ConversationKey,
        max_tokens_budget: usize,
    ) -> Result<Payload, ContextError> {
        let slot = self
            .existing(key)
            .ok_or_else(|| ContextError::UnknownConversation(key.clone()))?;
        let payload = slot.with(|c| c.build_payload(max_tokens_budget))?;
        debug!(
            "[{key}] payload: {} turns (~{} tokens, {} dropped), cache={}",
            payload.turns.len(),
            payload.estimated_tokens,
            payload.dropped_turns,
            payload
                .cache_boundary
                .map(|b| format!("#{b}"))
                .unwrap_or_else(|| "none".into())
        );
        Ok(payload)
    }

    /// Store a provider cache token for the last payload's prefix ending at
    /// `segment_boundary_seq`. Returns false if that prefix is unknown.
    pub fn record_cache_token(
        &self,
        key: &ConversationKey,
        segment_boundary_seq: u64,
        token: CacheToken,
    ) -> bool {
        match self.existing(key) {
            Some(slot) => slot.with(|c| c.record_cache_token(segment_boundary_seq, token)),
            None => false,
        }
    }

    /// Read-only copy of the sealed turns, in sequence order.
    pub fn snapshot(&self, key: &ConversationKey) -> Vec<Turn> {
        self.existing(key)
            .map(|slot| slot.with(|c| c.turns().to_vec()))
            .unwrap_or_default()
    }

    pub fn cache_segments(&self, key: &ConversationKey) -> Vec<CacheSegment> {
        self.existing(key)
            .map(|slot| slot.with(|c| c.segments().to_vec()))
            .unwrap_or_default()
    }

    pub fn open_tool_calls(&self, key: &ConversationKey) -> Vec<ToolCallRequest> {
        self.existing(key)
            .map(|slot| slot.with(|c| c.open_calls().to_vec()))
            .unwrap_or_default()
    }

    pub fn cycle_open(&self, key: &ConversationKey) -> bool {
        self.existing(key)
            .map(|slot| slot.with(|c| c.cycle_open()))
            .unwrap_or(false)
    }

    /// Remove turns with `seq >= from_seq`, invalidating cache segments whose
    /// boundary lies at or after it.
    pub fn rewind(&self, key: &ConversationKey, from_seq: u64) -> usize {
        let removed = self
            .existing(key)
            .map(|slot| slot.with(|c| c.rewind(from_seq)))
            .unwrap_or(0);
        if removed > 0 {
            info!("[{key}] rewound {removed} turn(s) from #{from_seq}");
        }
        removed
    }

    pub fn compaction_candidates(&self, key: &ConversationKey) -> Vec<Turn> {
        self.existing(key)
            .map(|slot| slot.with(|c| c.compaction_candidates()))
            .unwrap_or_default()
    }

    /// Append `summary` as a pinned note and hide turns up to `through_seq`
    /// from future payloads. The hidden turns stay in the snapshot.
    pub fn compact(
        &self,
        key: &ConversationKey,
        through_seq: u64,
        summary: impl Into<String>,
    ) -> Result<u64, ContextError> {
        let slot = self
            .existing(key)
            .ok_or_else(|| ContextError::UnknownConversation(key.clone()))?;
        let seq = slot.with(|c| c.compact(through_seq, summary.into()))?;
        info!("[{key}] compacted history through #{through_seq}");
        Ok(seq)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Drop a conversation. Refused while a cycle holds it.
    pub fn evict(&self, key: &ConversationKey) -> bool {
        self.slots
            .remove_if(key, |_, slot| slot.cycle.try_lock().is_ok())
            .is_some()
    }

    /// Evict every conversation idle for longer than `max_idle` with no cycle
    /// in flight. Returns the evicted keys.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<ConversationKey> {
        let mut evicted = Vec::new();
        self.slots.retain(|key, slot| {
            let idle = slot.state().last_active.elapsed() > max_idle;
            if idle && slot.cycle.try_lock().is_ok() {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            info!("Evicted {} idle conversation(s)", evicted.len());
        }
        evicted
    }
}
