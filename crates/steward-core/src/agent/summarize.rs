//! Folding older turns into a summary when the history no longer fits.

use crate::provider::ModelRequest;
use crate::turn::{Turn, TurnBody};

use super::preview;

pub const SUMMARIZATION_PROMPT: &str = "You are compacting a conversation between a user and an \
assistant so it can continue within a limited context window. Write a concise summary for the \
assistant that will carry on.\n\nInclude:\n- Facts, preferences, and constraints the user stated\n\
- Decisions made and results obtained from tools\n- Open questions or unfinished work\n\n\
Reply with the summary only.";

pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

const TURN_PREVIEW_CHARS: usize = 1_000;

/// One line per turn: `[#seq] role: text`.
pub fn render_transcript(turns: &[Turn], max_chars: usize) -> String {
    let lines: Vec<String> = turns
        .iter()
        .map(|turn| {
            let body = match turn.body() {
                TurnBody::UserMessage { text, .. } => format!("user: {text}"),
                TurnBody::AssistantMessage { text, tool_calls } => {
                    let mut line = format!("assistant: {text}");
                    for call in tool_calls {
                        line.push_str(&format!(" [calls {}({})]", call.tool_name, call.arguments));
                    }
                    line
                }
                TurnBody::ToolResult { output, ok, .. } => {
                    format!("tool ({}): {output}", if *ok { "ok" } else { "error" })
                }
                TurnBody::SystemNote { text } => format!("note: {text}"),
            };
            format!("[#{}] {}", turn.seq(), preview(&body, TURN_PREVIEW_CHARS))
        })
        .collect();

    // Keep the most recent lines that fit.
    let mut used = 0;
    let mut start = lines.len();
    while start > 0 {
        let cost = lines[start - 1].chars().count() + 1;
        if used + cost > max_chars {
            break;
        }
        used += cost;
        start -= 1;
    }
    lines[start..].join("\n")
}

pub fn summary_request(transcript: String, model_max_tokens: u64) -> ModelRequest {
    ModelRequest {
        system_prompt: SUMMARIZATION_PROMPT.to_string(),
        turns: vec![Turn::seal(1, TurnBody::user(transcript, Vec::new()), false)],
        cache_token: None,
        tools: Vec::new(),
        max_tokens: model_max_tokens.min(2_048),
        temperature: 0.3,
    }
}

pub fn summary_note(summary: &str) -> String {
    format!("{SUMMARY_PREFIX}\n{}", summary.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::ToolCallRequest;

    fn sealed(bodies: Vec<TurnBody>) -> Vec<Turn> {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, b)| Turn::seal(i as u64 + 1, b, false))
            .collect()
    }

    #[test]
    fn transcript_lists_every_turn_kind() {
        let turns = sealed(vec![
            TurnBody::user("what is 2+2", vec![]),
            TurnBody::assistant(
                "",
                vec![ToolCallRequest {
                    id: "c1".into(),
                    tool_name: "calculator".into(),
                    arguments: serde_json::json!({"expression": "2+2"}),
                }],
            ),
            TurnBody::tool_result("c1", "4", true),
            TurnBody::note("earlier summary"),
        ]);
        let transcript = render_transcript(&turns, 10_000);
        let lines: Vec<&str> = transcript.lines().collect();
        assert_eq!(lines[0], "[#1] user: what is 2+2");
        assert!(lines[1].contains("[calls calculator({\"expression\":\"2+2\"})]"));
        assert_eq!(lines[2], "[#3] tool (ok): 4");
        assert_eq!(lines[3], "[#4] note: earlier summary");
    }

    #[test]
    fn transcript_keeps_newest_lines_within_limit() {
        let turns = sealed(vec![
            TurnBody::user("a".repeat(50), vec![]),
            TurnBody::assistant("recent", vec![]),
        ]);
        let transcript = render_transcript(&turns, 30);
        assert_eq!(transcript, "[#2] assistant: recent");
    }

    #[test]
    fn request_has_no_tools() {
        let request = summary_request("[#1] user: hi".into(), 8_192);
        assert!(request.tools.is_empty());
        assert_eq!(request.max_tokens, 2_048);
        assert_eq!(request.turns.len(), 1);
    }
}
