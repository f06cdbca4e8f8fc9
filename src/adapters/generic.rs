//! Fallback adapter for arbitrary CLI tools.
//!
//! Launches `<tool> <prompt>` and relies on the session exiting for
//! completion; state detection and auto-confirm are not attempted.

use regex::{Regex, RegexBuilder};

use super::{tail_chars, Completion, ConfirmAction, ToolAdapter};
use crate::models::{AgentState, Context, TaskDefinition};

const COMPLETION_WINDOW: usize = 500;

pub struct GenericAdapter {
    shell_prompt_pattern: Regex,
    error_pattern: Regex,
}

impl Default for GenericAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericAdapter {
    pub fn new() -> Self {
        Self {
            shell_prompt_pattern: RegexBuilder::new(r"(\$|\#|>)\s*$")
                .multi_line(true)
                .build()
                .expect("generic pattern"),
            error_pattern: RegexBuilder::new(
                r"(Error:|error:|FAILED|fatal:|Exception|command not found|No such file)",
            )
            .case_insensitive(true)
            .build()
            .expect("generic pattern"),
        }
    }
}

impl ToolAdapter for GenericAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn display_name(&self) -> &str {
        "Generic CLI"
    }

    /// The tool field doubles as the binary name.
    fn launch_argv(&self, task: &TaskDefinition, _context: &Context) -> Vec<String> {
        vec![task.tool.clone(), task.prompt.clone()]
    }

    fn startup_wait_seconds(&self) -> f64 {
        0.0
    }

    fn detect_state(&self, _output: &str) -> Option<AgentState> {
        None
    }

    fn should_auto_confirm(&self, _output: &str) -> Option<ConfirmAction> {
        None
    }

    fn detect_completion(&self, output: &str) -> Option<Completion> {
        if self.error_pattern.is_match(output) {
            return Some(Completion::Failed);
        }
        let recent = tail_chars(output, COMPLETION_WINDOW);
        if self.shell_prompt_pattern.is_match(recent) && output.len() > 50 {
            return Some(Completion::Completed);
        }
        None
    }
}
