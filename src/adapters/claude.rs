//! Claude Code adapter.
//!
//! Runs Claude in interactive mode (not headless `-p`) with
//! pre-authorized tools via `--allowed-tools`. The task prompt is typed
//! in once the TUI draws its input prompt.

use regex::{Regex, RegexBuilder};

use super::{last_match_state, rstrip_lines, tail_chars, Completion, ConfirmAction, ToolAdapter};
use crate::models::{AgentState, Context, TaskDefinition};
use crate::utils::ansi::strip_ansi;

const STATE_WINDOW: usize = 2000;
const CONFIRM_WINDOW: usize = 500;

/// Adapter for the Claude Code CLI.
pub struct ClaudeAdapter {
    state_patterns: Vec<(AgentState, Regex)>,
    confirm_rules: Vec<(Regex, ConfirmAction)>,
    ready_pattern: Regex,
    task_summary_pattern: Regex,
    cost_pattern: Regex,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        let ci = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("claude pattern")
        };

        // State detection keys off Claude's TUI tool-call markers
        // (● ToolName(...)), which are stable across versions.
        let state_patterns = vec![
            (
                AgentState::Planning,
                ci(r"(● Read\(|● Glob\(|● Grep\(|● WebFetch\(|● WebSearch\(|Thinking|Analyzing)"),
            ),
            (
                AgentState::Editing,
                Regex::new(r"(● Edit\(|● Write\(|● NotebookEdit\()").expect("claude pattern"),
            ),
            (
                AgentState::Testing,
                ci(r"(● Bash\(|Running tests|pytest|npm test|npm run)"),
            ),
            (
                AgentState::Committing,
                ci(r"(git commit|git push|gh pr create)"),
            ),
        ];

        // Ordered: more specific rules first. Select menus ship with the
        // cursor already on the right option and want Enter only;
        // numbered menus want the digit without Enter.
        let confirm_rules = vec![
            (
                RegexBuilder::new(r"Enter to confirm.*Esc to cancel")
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .expect("claude pattern"),
                ConfirmAction::new("", true),
            ),
            (
                ci(r"Do\s+you\s+want\s+to\s+proceed"),
                ConfirmAction::new("1", false),
            ),
            (ci(r"1\.\s*(Yes|Allow)"), ConfirmAction::new("1", false)),
            (ci(r"Allow\s+(once|always)"), ConfirmAction::new("", true)),
            (
                ci(r"\(y/n\)|\[Y/n\]|\[y/N\]"),
                ConfirmAction::new("y", true),
            ),
        ];

        Self {
            state_patterns,
            confirm_rules,
            // The input prompt: "❯" at the start of a line between the
            // horizontal-rule borders.
            ready_pattern: RegexBuilder::new(r"^❯")
                .multi_line(true)
                .build()
                .expect("claude pattern"),
            // Task summary "✻ <verb> for <time>". Claude rotates verbs
            // (Crunched, Sautéed, Whisked, ...) but the shape is stable.
            task_summary_pattern: Regex::new(r"✻ .+ for \d+").expect("claude pattern"),
            cost_pattern: ci(r"Total cost:\s*\$?([\d.]+)"),
        }
    }
}

impl ToolAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn display_name(&self) -> &str {
        "Claude Code"
    }

    fn launch_argv(&self, _task: &TaskDefinition, _context: &Context) -> Vec<String> {
        vec![
            "claude".to_string(),
            "--allowed-tools".to_string(),
            "Bash,Edit,Read,Write,Glob,Grep,WebFetch,TodoWrite,NotebookEdit".to_string(),
        ]
    }

    fn needs_prompt_after_launch(&self) -> bool {
        true
    }

    fn startup_wait_seconds(&self) -> f64 {
        30.0
    }

    fn is_ready_for_input(&self, output: &str) -> bool {
        self.ready_pattern.is_match(&strip_ansi(output))
    }

    fn detect_state(&self, output: &str) -> Option<AgentState> {
        let recent = tail_chars(output, STATE_WINDOW);
        let clean = strip_ansi(recent);
        last_match_state(&self.state_patterns, &clean)
    }

    fn should_auto_confirm(&self, output: &str) -> Option<ConfirmAction> {
        let clean = rstrip_lines(&strip_ansi(output));
        let recent = tail_chars(&clean, CONFIRM_WINDOW);
        self.confirm_rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(recent))
            .map(|(_, action)| action.clone())
    }

    /// Claude shows `❯ <prompt>` when the task is sent, work output,
    /// then a fresh `❯` when done. Two prompt markers mean the task
    /// finished; one marker plus the task summary covers long outputs
    /// where the first marker scrolled past the capture window.
    fn detect_completion(&self, output: &str) -> Option<Completion> {
        let clean = strip_ansi(output);
        let prompt_count = self.ready_pattern.find_iter(&clean).count();
        if prompt_count >= 2 {
            return Some(Completion::Completed);
        }
        if prompt_count == 1 && self.task_summary_pattern.is_match(&clean) {
            return Some(Completion::Completed);
        }
        None
    }

    fn estimate_cost(&self, output: &str) -> Option<f64> {
        self.cost_pattern
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}
