pub mod config;
pub mod r#loop;
pub mod retry;
pub mod state;
pub mod summarize;

pub use config::AgentConfig;
pub use r#loop::AgentLoop;
pub use retry::RetryPolicy;
pub use state::{CycleOutcome, LoopFailure, LoopPhase, LoopState};

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// `s` cut to at most `max` bytes for logging, with a marker when cut.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let end = floor_char_boundary(s, max);
    format!("{}... ({} chars)", &s[..end], s.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        let cut = preview("héllo wörld", 2);
        assert!(cut.starts_with("h..."));
        assert!(cut.ends_with("(11 chars)"));
    }
}
