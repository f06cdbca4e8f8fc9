//! Aider adapter: interactive pair-programming tool, prompt typed in
//! after startup.

use regex::{Regex, RegexBuilder};

use super::{tail_chars, Completion, ConfirmAction, ToolAdapter};
use crate::models::{AgentState, Context, TaskDefinition};

const STATE_WINDOW: usize = 2000;
const CONFIRM_WINDOW: usize = 500;

pub struct AiderAdapter {
    state_patterns: Vec<(AgentState, Regex)>,
    confirm_rules: Vec<(Regex, ConfirmAction)>,
    completion_pattern: Regex,
    error_pattern: Regex,
}

impl Default for AiderAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AiderAdapter {
    pub fn new() -> Self {
        let ci = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("aider pattern")
        };

        Self {
            state_patterns: vec![
                (
                    AgentState::Planning,
                    ci(r"(Thinking|Analyzing|Looking at|Searching|Reviewing)"),
                ),
                (
                    AgentState::Editing,
                    ci(r"(Applied edit|Wrote|Created|Updated|Modified|SEARCH/REPLACE)"),
                ),
                (
                    AgentState::Testing,
                    ci(r"(Running|Testing|Linting|pytest|npm test|make test)"),
                ),
                (
                    AgentState::Committing,
                    ci(r"(Commit|commit [a-f0-9]|git add|Added .* to the chat)"),
                ),
            ],
            confirm_rules: vec![
                (ci(r"Create new file.*\?"), ConfirmAction::new("y", true)),
                (ci(r"Allow edits.*\?"), ConfirmAction::new("y", true)),
                (ci(r"Add .* to the chat\?"), ConfirmAction::new("y", true)),
                (ci(r"Apply.*\[Y/n\]"), ConfirmAction::new("y", true)),
                (ci(r"Commit.*\[y/n\]"), ConfirmAction::new("y", true)),
            ],
            completion_pattern: ci(r"(Tokens:.*sent,.*received|aider>)"),
            error_pattern: ci(r"(Error:|error:|FAILED|APIError|RateLimitError|Can't initialize)"),
        }
    }
}

impl ToolAdapter for AiderAdapter {
    fn name(&self) -> &str {
        "aider"
    }

    fn display_name(&self) -> &str {
        "Aider"
    }

    /// `--yes` auto-accepts changes; `--no-git` leaves commit lifecycle
    /// to the supervisor.
    fn launch_argv(&self, _task: &TaskDefinition, _context: &Context) -> Vec<String> {
        vec![
            "aider".to_string(),
            "--yes".to_string(),
            "--no-git".to_string(),
        ]
    }

    fn needs_prompt_after_launch(&self) -> bool {
        true
    }

    fn startup_wait_seconds(&self) -> f64 {
        5.0
    }

    fn is_ready_for_input(&self, output: &str) -> bool {
        output.contains("aider>")
    }

    fn detect_state(&self, output: &str) -> Option<AgentState> {
        let recent = tail_chars(output, STATE_WINDOW);
        self.state_patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(recent))
            .map(|(state, _)| *state)
    }

    fn should_auto_confirm(&self, output: &str) -> Option<ConfirmAction> {
        let recent = tail_chars(output, CONFIRM_WINDOW);
        self.confirm_rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(recent))
            .map(|(_, action)| action.clone())
    }

    /// After a task Aider prints token stats and returns to its
    /// `aider>` prompt; either marker after substantial output counts.
    fn detect_completion(&self, output: &str) -> Option<Completion> {
        if self.error_pattern.is_match(output) {
            return Some(Completion::Failed);
        }
        let recent = tail_chars(output, CONFIRM_WINDOW);
        if self.completion_pattern.is_match(recent) && output.len() > 200 {
            return Some(Completion::Completed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn adapter() -> AiderAdapter {
        AiderAdapter::new()
    }

    #[test]
    fn test_interactive_launch() {
        let task = TaskDefinition::new("aider", "refactor module").unwrap();
        let context = Context::new("c", "/tmp", Default::default()).unwrap();
        let argv = adapter().launch_argv(&task, &context);
        assert_eq!(argv, vec!["aider", "--yes", "--no-git"]);
        assert!(adapter().needs_prompt_after_launch());
        assert_eq!(adapter().startup_wait_seconds(), 5.0);
    }

    #[test]
    fn test_confirm_file_creation() {
        let action = adapter()
            .should_auto_confirm("Create new file src/new.rs? (Y)es/(N)o")
            .unwrap();
        assert_eq!(action, ConfirmAction::new("y", true));
    }

    #[test]
    fn test_completion_needs_token_stats_and_length() {
        let a = adapter();
        let short = "Tokens: 1.2k sent, 300 received.";
        assert_eq!(a.detect_completion(short), None);
        let long = format!("{}\nTokens: 1.2k sent, 300 received.\naider>", "x".repeat(300));
        assert_eq!(a.detect_completion(&long), Some(Completion::Completed));
    }

    #[test]
    fn test_api_error_fails() {
        assert_eq!(
            adapter().detect_completion("RateLimitError: slow down"),
            Some(Completion::Failed)
        );
    }

    #[test]
    fn test_editing_state() {
        assert_eq!(
            adapter().detect_state("Applied edit to src/lib.rs"),
            Some(AgentState::Editing)
        );
    }
}
