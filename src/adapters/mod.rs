//! Tool adapters: per-tool knowledge for launching, reading, and
//! steering AI coding tools.
//!
//! An adapter is a set of pure functions over recent pane text and the
//! task definition. Hand-written adapters cover the common tools;
//! declarative ones are loaded from TOML and compiled to the same
//! interface.

mod aider;
mod claude;
mod codex;
mod configurable;
mod generic;
mod registry;

pub use aider::AiderAdapter;
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use configurable::ConfigurableAdapter;
pub use generic::GenericAdapter;
pub use registry::AdapterRegistry;

use crate::models::{AgentState, Context, TaskDefinition};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter.{0} is required")]
    MissingField(&'static str),
    #[error("Adapter '{0}' is already registered")]
    DuplicateName(String),
    #[error("Unknown regex flag: '{0}' (valid: IGNORECASE, MULTILINE, DOTALL)")]
    UnknownFlag(String),
    #[error("Unknown state: '{0}'")]
    UnknownState(String),
    #[error("Unknown state.strategy: '{0}' (valid: 'first', 'last')")]
    UnknownStateStrategy(String),
    #[error("Unknown completion.strategy: '{0}' (valid: 'pattern', 'prompt_count', 'process_exit')")]
    UnknownCompletionStrategy(String),
    #[error("Invalid pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("Failed to read adapter file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse adapter file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },
}

/// How to respond to an auto-confirm prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmAction {
    /// Text to send (may be empty for Enter-only select menus).
    pub response: String,
    /// Whether to send Enter after the response.
    pub send_enter: bool,
}

impl ConfirmAction {
    pub fn new(response: impl Into<String>, send_enter: bool) -> Self {
        Self {
            response: response.into(),
            send_enter,
        }
    }
}

/// Adapter's verdict on whether the tool finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Failed,
}

/// Per-tool behavior for launching, monitoring, and interacting with an
/// AI coding tool.
#[cfg_attr(test, mockall::automock)]
pub trait ToolAdapter: Send + Sync {
    /// Machine-readable identifier, e.g. "claude".
    fn name(&self) -> &str;

    /// Human-readable name, e.g. "Claude Code".
    fn display_name(&self) -> &str;

    /// The argv that launches this tool. May embed the prompt or not;
    /// see [`ToolAdapter::needs_prompt_after_launch`].
    fn launch_argv(&self, task: &TaskDefinition, context: &Context) -> Vec<String>;

    /// True for interactive tools whose prompt is typed in after the
    /// tool reports readiness.
    fn needs_prompt_after_launch(&self) -> bool {
        false
    }

    /// Upper bound on the readiness wait after launch, in seconds.
    fn startup_wait_seconds(&self) -> f64 {
        2.0
    }

    /// Whether the tool is currently drawing an input prompt.
    fn is_ready_for_input(&self, _output: &str) -> bool {
        true
    }

    /// Detect the current activity state from recent output.
    fn detect_state(&self, output: &str) -> Option<AgentState>;

    /// Check the trailing output against this tool's ordered confirm
    /// rules; the first match wins.
    fn should_auto_confirm(&self, output: &str) -> Option<ConfirmAction>;

    /// Detect whether the tool finished, and how.
    fn detect_completion(&self, output: &str) -> Option<Completion>;

    /// Extract a cost estimate from the output, if the tool reports one.
    fn estimate_cost(&self, _output: &str) -> Option<f64> {
        None
    }

    /// Extract modified file paths from the output.
    fn parse_files_changed(&self, _output: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Last `n` characters of `s`, on a char boundary.
pub(crate) fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Right-strip every line and drop trailing blank lines. Remote captures
/// pad lines to the terminal width, which would otherwise push prompt
/// text outside a fixed-size tail window.
pub(crate) fn rstrip_lines(s: &str) -> String {
    s.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Resolve the last-positioned match across several (state, regex)
/// tables: the most recent activity in the stream wins.
pub(crate) fn last_match_state(
    patterns: &[(AgentState, regex::Regex)],
    text: &str,
) -> Option<AgentState> {
    let mut best: Option<(usize, AgentState)> = None;
    for (state, pattern) in patterns {
        for m in pattern.find_iter(text) {
            if best.map_or(true, |(pos, _)| m.start() > pos) {
                best = Some((m.start(), *state));
            }
        }
    }
    best.map(|(_, state)| state)
}
