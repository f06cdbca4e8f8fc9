//! OpenAI Codex CLI adapter: headless full-auto execution with
//! pattern-based detection throughout.

use regex::{Regex, RegexBuilder};

use super::{tail_chars, Completion, ConfirmAction, ToolAdapter};
use crate::models::{AgentState, Context, TaskDefinition};

const STATE_WINDOW: usize = 2000;
const COMPLETION_WINDOW: usize = 500;

pub struct CodexAdapter {
    state_patterns: Vec<(AgentState, Regex)>,
    confirm_rules: Vec<(Regex, ConfirmAction)>,
    completion_pattern: Regex,
    error_pattern: Regex,
    shell_prompt_pattern: Regex,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexAdapter {
    pub fn new() -> Self {
        let ci = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("codex pattern")
        };

        Self {
            state_patterns: vec![
                (
                    AgentState::Planning,
                    ci(r"(Thinking|Planning|Analyzing|Reading|Searching|Reviewing)"),
                ),
                (
                    AgentState::Editing,
                    ci(r"(Editing|Writing|Creating|Modifying|Applying|Patching)"),
                ),
                (
                    AgentState::Testing,
                    ci(r"(Running|Testing|Executing|Verifying|npm test|pytest|cargo test)"),
                ),
                (
                    AgentState::Committing,
                    ci(r"(Committing|Pushing|git commit|git push|Creating PR)"),
                ),
            ],
            confirm_rules: vec![
                (
                    ci(r"(Apply|Accept|Approve|Continue|Proceed).*\[Y/n\]"),
                    ConfirmAction::new("y", true),
                ),
                (
                    ci(r"(Apply|Accept|Approve|Continue|Proceed).*\[y/N\]"),
                    ConfirmAction::new("y", true),
                ),
                (ci(r"Press Enter"), ConfirmAction::new("", true)),
            ],
            completion_pattern: ci(r"(Done|Completed|Finished|All changes applied)"),
            error_pattern: ci(r"(Error:|error:|FAILED|fatal:|Exception|command not found)"),
            shell_prompt_pattern: RegexBuilder::new(r"(\$|\#|>)\s*$")
                .multi_line(true)
                .build()
                .expect("codex pattern"),
        }
    }
}

impl ToolAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn display_name(&self) -> &str {
        "OpenAI Codex"
    }

    /// Codex takes the prompt directly on its argv in full-auto mode.
    fn launch_argv(&self, task: &TaskDefinition, _context: &Context) -> Vec<String> {
        vec![
            "codex".to_string(),
            "--full-auto".to_string(),
            task.prompt.clone(),
        ]
    }

    fn startup_wait_seconds(&self) -> f64 {
        0.0
    }

    fn detect_state(&self, output: &str) -> Option<AgentState> {
        let recent = tail_chars(output, STATE_WINDOW);
        // First-match resolution: Codex states do not re-enter.
        self.state_patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(recent))
            .map(|(state, _)| *state)
    }

    fn should_auto_confirm(&self, output: &str) -> Option<ConfirmAction> {
        let recent = tail_chars(output, COMPLETION_WINDOW);
        self.confirm_rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(recent))
            .map(|(_, action)| action.clone())
    }

    fn detect_completion(&self, output: &str) -> Option<Completion> {
        if self.error_pattern.is_match(output) {
            return Some(Completion::Failed);
        }
        let recent = tail_chars(output, COMPLETION_WINDOW);
        if self.completion_pattern.is_match(recent) {
            return Some(Completion::Completed);
        }
        if self.shell_prompt_pattern.is_match(recent) && output.len() > 100 {
            return Some(Completion::Completed);
        }
        None
    }
}
