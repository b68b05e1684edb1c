//! Budget-driven truncation of the history sent to the model.
//!
//! History is split into units that must travel together: an assistant turn
//! that requested tools plus the results answering it, or a single turn.
//! Units are dropped oldest-first; protected units are never dropped:
//!
//! - system notes and pinned turns,
//! - everything from the latest user message onward (the live cycle, whose
//!   tool dependents may still be in flight).

use std::collections::HashSet;
use std::ops::Range;

use crate::turn::{Turn, TurnBody};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Indices into the candidate slice, in order.
    pub kept: Vec<usize>,
    pub estimated_tokens: usize,
    pub dropped_turns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Tokens still required after every droppable unit was removed.
    pub required: usize,
    pub budget: usize,
}

#[derive(Debug)]
struct Unit {
    range: Range<usize>,
    tokens: usize,
    protected: bool,
}

fn split_units(turns: &[Turn]) -> Vec<Unit> {
    let live_from = turns.iter().rposition(Turn::is_user).unwrap_or(turns.len());
    let mut units = Vec::new();
    let mut i = 0;
    while i < turns.len() {
        let start = i;
        let calls: HashSet<&str> = turns[i]
            .body()
            .tool_calls()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        i += 1;
        if !calls.is_empty() {
            while let Some(TurnBody::ToolResult { tool_call_id, .. }) = turns.get(i).map(Turn::body) {
                if !calls.contains(tool_call_id.as_str()) {
                    break;
                }
                i += 1;
            }
        }
        let members = &turns[start..i];
        units.push(Unit {
            range: start..i,
            tokens: members.iter().map(Turn::estimated_tokens).sum(),
            protected: start >= live_from
                || members.iter().any(|t| t.pinned() || t.is_system_note()),
        });
    }
    units
}

/// Choose which candidate turns fit in `budget` tokens.
pub fn select(turns: &[Turn], budget: usize) -> Result<Selection, Overflow> {
    let units = split_units(turns);
    let mut total: usize = units.iter().map(|u| u.tokens).sum();
    let mut dropped = vec![false; units.len()];

    for (idx, unit) in units.iter().enumerate() {
        if total <= budget {
            break;
        }
        if unit.protected {
            continue;
        }
        dropped[idx] = true;
        total -= unit.tokens;
    }

    if total > budget {
        return Err(Overflow {
            required: total,
            budget,
        });
    }

    let mut kept = Vec::new();
    let mut dropped_turns = 0;
    for (unit, gone) in units.iter().zip(&dropped) {
        if *gone {
            dropped_turns += unit.range.len();
        } else {
            kept.extend(unit.range.clone());
        }
    }
    Ok(Selection {
        kept,
        estimated_tokens: total,
        dropped_turns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::ToolCallRequest;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            tool_name: "calculator".into(),
            arguments: serde_json::json!({}),
        }
    }

    fn seal_all(bodies: Vec<(TurnBody, bool)>) -> Vec<Turn> {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, (b, pinned))| Turn::seal(i as u64 + 1, b, pinned))
            .collect()
    }

    fn text(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn everything_kept_under_budget() {
        let turns = seal_all(vec![
            (TurnBody::user("hi", vec![]), false),
            (TurnBody::assistant("hello", vec![]), false),
        ]);
        let sel = select(&turns, 1_000).unwrap();
        assert_eq!(sel.kept, vec![0, 1]);
        assert_eq!(sel.dropped_turns, 0);
    }

    #[test]
    fn oldest_droppable_go_first() {
        // Each 40-char turn costs 14 tokens.
        let turns = seal_all(vec![
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::assistant(text(40), vec![]), false),
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::assistant(text(40), vec![]), false),
            (TurnBody::user(text(40), vec![]), false),
        ]);
        let sel = select(&turns, 14 * 3).unwrap();
        assert_eq!(sel.kept, vec![2, 3, 4]);
        assert_eq!(sel.dropped_turns, 2);
    }

    #[test]
    fn tool_round_dropped_as_a_unit() {
        let turns = seal_all(vec![
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::assistant("", vec![call("a"), call("b")]), false),
            (TurnBody::tool_result("b", text(40), true), false),
            (TurnBody::tool_result("a", text(40), true), false),
            (TurnBody::assistant(text(40), vec![]), false),
            (TurnBody::user(text(40), vec![]), false),
        ]);
        // Budget only allows dropping the first user turn plus the whole round.
        let total: usize = turns.iter().map(Turn::estimated_tokens).sum();
        let round: usize = turns[1..4].iter().map(Turn::estimated_tokens).sum();
        let budget = total - turns[0].estimated_tokens() - round;
        let sel = select(&turns, budget).unwrap();
        assert_eq!(sel.kept, vec![4, 5]);
        assert!(!sel.kept.contains(&2) && !sel.kept.contains(&3));
    }

    #[test]
    fn never_splits_request_from_result() {
        let turns = seal_all(vec![
            (TurnBody::assistant("", vec![call("a")]), false),
            (TurnBody::tool_result("a", text(400), true), false),
            (TurnBody::user(text(4), vec![]), false),
        ]);
        let budget = turns[1..].iter().map(Turn::estimated_tokens).sum::<usize>();
        let sel = select(&turns, budget).unwrap();
        // Dropping only the request would fit, but the pair leaves together.
        assert_eq!(sel.kept, vec![2]);
    }

    #[test]
    fn system_notes_and_pinned_survive() {
        let turns = seal_all(vec![
            (TurnBody::note(text(40)), false),
            (TurnBody::user(text(40), vec![]), true),
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::assistant(text(40), vec![]), false),
            (TurnBody::user(text(40), vec![]), false),
        ]);
        let sel = select(&turns, 14 * 3).unwrap();
        assert_eq!(sel.kept, vec![0, 1, 4]);
    }

    #[test]
    fn live_cycle_is_protected() {
        let turns = seal_all(vec![
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::assistant("", vec![call("a")]), false),
            (TurnBody::tool_result("a", text(400), true), false),
        ]);
        let err = select(&turns, 20).unwrap_err();
        assert_eq!(err.budget, 20);
        assert_eq!(
            err.required,
            turns.iter().map(Turn::estimated_tokens).sum::<usize>()
        );
    }

    #[test]
    fn overflow_reports_remaining_requirement() {
        let turns = seal_all(vec![
            (TurnBody::user(text(40), vec![]), false),
            (TurnBody::user(text(400), vec![]), false),
        ]);
        let err = select(&turns, 10).unwrap_err();
        assert_eq!(err.required, turns[1].estimated_tokens());
    }
}
