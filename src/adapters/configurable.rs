//! TOML-declared adapters.
//!
//! New tools can be integrated without code: a TOML file declares the
//! launch command, readiness and state patterns, ordered confirm rules,
//! and a completion strategy. Everything is validated and compiled to
//! regex tables at load, then served through the same [`ToolAdapter`]
//! interface as the built-ins.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use super::{
    last_match_state, rstrip_lines, tail_chars, AdapterError, Completion, ConfirmAction,
    ToolAdapter,
};
use crate::models::{AgentState, Context, TaskDefinition};
use crate::utils::ansi::strip_ansi;

/// Raw TOML shape, deserialized before validation/compilation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub adapter: AdapterSection,
    #[serde(default)]
    pub launch: LaunchSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub completion: CompletionSection,
    #[serde(default)]
    pub confirm: Vec<ConfirmRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchSection {
    pub command: Vec<String>,
    pub prompt_after_launch: bool,
    pub startup_wait: f64,
    pub strip_ansi: bool,
    pub ready_pattern: Option<String>,
    pub ready_flags: Vec<String>,
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            prompt_after_launch: false,
            startup_wait: 2.0,
            strip_ansi: false,
            ready_pattern: None,
            ready_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub strategy: String,
    pub recent_chars: usize,
    pub patterns: Vec<StatePattern>,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            strategy: "first".to_string(),
            recent_chars: 2000,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatePattern {
    pub pattern: String,
    pub state: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    pub strategy: String,
    pub recent_chars: usize,
    pub min_output_length: usize,
    pub error_search_full: bool,
    pub completion_pattern: Option<String>,
    pub completion_flags: Vec<String>,
    pub error_pattern: Option<String>,
    pub error_flags: Vec<String>,
    pub shell_prompt_pattern: Option<String>,
    pub shell_prompt_flags: Vec<String>,
    pub prompt_pattern: Option<String>,
    pub prompt_flags: Vec<String>,
    pub prompt_count_threshold: usize,
    pub fallback_summary_pattern: Option<String>,
    pub fallback_summary_flags: Vec<String>,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            strategy: "process_exit".to_string(),
            recent_chars: 500,
            min_output_length: 100,
            error_search_full: true,
            completion_pattern: None,
            completion_flags: Vec::new(),
            error_pattern: None,
            error_flags: Vec::new(),
            shell_prompt_pattern: None,
            shell_prompt_flags: Vec::new(),
            prompt_pattern: None,
            prompt_flags: Vec::new(),
            prompt_count_threshold: 2,
            fallback_summary_pattern: None,
            fallback_summary_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRule {
    pub pattern: String,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_true")]
    pub send_enter: bool,
    #[serde(default)]
    pub flags: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateStrategy {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionStrategy {
    Pattern,
    PromptCount,
    ProcessExit,
}

/// A fully compiled declarative adapter.
#[derive(Debug)]
pub struct ConfigurableAdapter {
    name: String,
    display_name: String,
    command: Vec<String>,
    prompt_after_launch: bool,
    startup_wait: f64,
    strip: bool,
    ready_pattern: Option<Regex>,
    state_strategy: StateStrategy,
    state_recent_chars: usize,
    state_patterns: Vec<(AgentState, Regex)>,
    completion_strategy: CompletionStrategy,
    completion_recent_chars: usize,
    min_output_length: usize,
    error_search_full: bool,
    completion_pattern: Option<Regex>,
    error_pattern: Option<Regex>,
    shell_prompt_pattern: Option<Regex>,
    prompt_pattern: Option<Regex>,
    prompt_count_threshold: usize,
    fallback_summary_pattern: Option<Regex>,
    confirm_rules: Vec<(Regex, ConfirmAction)>,
}

fn compile(pattern: &str, flags: &[String]) -> Result<Regex, AdapterError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags {
        match flag.to_uppercase().as_str() {
            "IGNORECASE" => builder.case_insensitive(true),
            "MULTILINE" => builder.multi_line(true),
            "DOTALL" => builder.dot_matches_new_line(true),
            _ => return Err(AdapterError::UnknownFlag(flag.clone())),
        };
    }
    builder.build().map_err(|source| AdapterError::BadPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_optional(
    pattern: &Option<String>,
    flags: &[String],
) -> Result<Option<Regex>, AdapterError> {
    pattern.as_deref().map(|p| compile(p, flags)).transpose()
}

impl ConfigurableAdapter {
    /// Validate and compile a raw config. Unknown strategies, states,
    /// and flags are rejected here, not at match time.
    pub fn from_config(config: AdapterConfig) -> Result<Self, AdapterError> {
        if config.adapter.name.is_empty() {
            return Err(AdapterError::MissingField("name"));
        }
        if config.adapter.display_name.is_empty() {
            return Err(AdapterError::MissingField("display_name"));
        }

        let state_strategy = match config.state.strategy.as_str() {
            "first" => StateStrategy::First,
            "last" => StateStrategy::Last,
            other => return Err(AdapterError::UnknownStateStrategy(other.to_string())),
        };
        let completion_strategy = match config.completion.strategy.as_str() {
            "pattern" => CompletionStrategy::Pattern,
            "prompt_count" => CompletionStrategy::PromptCount,
            "process_exit" => CompletionStrategy::ProcessExit,
            other => return Err(AdapterError::UnknownCompletionStrategy(other.to_string())),
        };

        let mut state_patterns = Vec::with_capacity(config.state.patterns.len());
        for entry in &config.state.patterns {
            let state = AgentState::parse(&entry.state)
                .ok_or_else(|| AdapterError::UnknownState(entry.state.clone()))?;
            state_patterns.push((state, compile(&entry.pattern, &entry.flags)?));
        }

        let mut confirm_rules = Vec::with_capacity(config.confirm.len());
        for rule in &config.confirm {
            confirm_rules.push((
                compile(&rule.pattern, &rule.flags)?,
                ConfirmAction::new(rule.response.clone(), rule.send_enter),
            ));
        }

        Ok(Self {
            name: config.adapter.name,
            display_name: config.adapter.display_name,
            command: config.launch.command,
            prompt_after_launch: config.launch.prompt_after_launch,
            startup_wait: config.launch.startup_wait,
            strip: config.launch.strip_ansi,
            ready_pattern: compile_optional(
                &config.launch.ready_pattern,
                &config.launch.ready_flags,
            )?,
            state_strategy,
            state_recent_chars: config.state.recent_chars,
            state_patterns,
            completion_strategy,
            completion_recent_chars: config.completion.recent_chars,
            min_output_length: config.completion.min_output_length,
            error_search_full: config.completion.error_search_full,
            completion_pattern: compile_optional(
                &config.completion.completion_pattern,
                &config.completion.completion_flags,
            )?,
            error_pattern: compile_optional(
                &config.completion.error_pattern,
                &config.completion.error_flags,
            )?,
            shell_prompt_pattern: compile_optional(
                &config.completion.shell_prompt_pattern,
                &config.completion.shell_prompt_flags,
            )?,
            prompt_pattern: compile_optional(
                &config.completion.prompt_pattern,
                &config.completion.prompt_flags,
            )?,
            prompt_count_threshold: config.completion.prompt_count_threshold,
            fallback_summary_pattern: compile_optional(
                &config.completion.fallback_summary_pattern,
                &config.completion.fallback_summary_flags,
            )?,
            confirm_rules,
        })
    }

    /// Load an adapter from a TOML file.
    pub fn from_toml(path: &Path) -> Result<Self, AdapterError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AdapterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AdapterConfig =
            toml::from_str(&contents).map_err(|source| AdapterError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_config(config)
    }

    fn clean<'a>(&self, output: &'a str) -> std::borrow::Cow<'a, str> {
        if self.strip {
            std::borrow::Cow::Owned(strip_ansi(output))
        } else {
            std::borrow::Cow::Borrowed(output)
        }
    }

    fn detect_completion_pattern(&self, output: &str) -> Option<Completion> {
        let clean = self.clean(output);

        if let Some(error_pattern) = &self.error_pattern {
            let search_text = if self.error_search_full {
                clean.as_ref()
            } else {
                tail_chars(&clean, self.completion_recent_chars)
            };
            if error_pattern.is_match(search_text) {
                return Some(Completion::Failed);
            }
        }

        let recent = tail_chars(&clean, self.completion_recent_chars);
        if let Some(completion_pattern) = &self.completion_pattern {
            if completion_pattern.is_match(recent) {
                return Some(Completion::Completed);
            }
        }
        if let Some(shell_prompt) = &self.shell_prompt_pattern {
            if shell_prompt.is_match(recent) && clean.len() > self.min_output_length {
                return Some(Completion::Completed);
            }
        }
        None
    }

    fn detect_completion_prompt_count(&self, output: &str) -> Option<Completion> {
        let prompt_pattern = self.prompt_pattern.as_ref()?;
        let clean = self.clean(output);

        let count = prompt_pattern.find_iter(&clean).count();
        if count >= self.prompt_count_threshold {
            return Some(Completion::Completed);
        }
        // A single prompt plus the tool's own summary marker covers
        // captures where the first prompt scrolled away.
        if count == 1 {
            if let Some(summary) = &self.fallback_summary_pattern {
                if summary.is_match(&clean) {
                    return Some(Completion::Completed);
                }
            }
        }
        None
    }
}

impl ToolAdapter for ConfigurableAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Build the launch argv, substituting `{prompt}` and `{path}`.
    ///
    /// Substitution is single-pass with one placeholder per element: a
    /// prompt that itself contains `{path}` is not re-substituted.
    fn launch_argv(&self, task: &TaskDefinition, context: &Context) -> Vec<String> {
        let replacements = [("{prompt}", &task.prompt), ("{path}", &context.path)];
        self.command
            .iter()
            .map(|part| {
                for (key, value) in &replacements {
                    if part.contains(key) {
                        return part.replace(key, value);
                    }
                }
                part.clone()
            })
            .collect()
    }

    fn needs_prompt_after_launch(&self) -> bool {
        self.prompt_after_launch
    }

    fn startup_wait_seconds(&self) -> f64 {
        self.startup_wait
    }

    fn is_ready_for_input(&self, output: &str) -> bool {
        match &self.ready_pattern {
            Some(pattern) => pattern.is_match(&self.clean(output)),
            None => true,
        }
    }

    fn detect_state(&self, output: &str) -> Option<AgentState> {
        let recent_owned;
        let recent = {
            let tail = tail_chars(output, self.state_recent_chars);
            if self.strip {
                recent_owned = strip_ansi(tail);
                recent_owned.as_str()
            } else {
                tail
            }
        };

        match self.state_strategy {
            StateStrategy::Last => last_match_state(&self.state_patterns, recent),
            StateStrategy::First => self
                .state_patterns
                .iter()
                .find(|(_, pattern)| pattern.is_match(recent))
                .map(|(state, _)| *state),
        }
    }

    fn should_auto_confirm(&self, output: &str) -> Option<ConfirmAction> {
        let clean = rstrip_lines(&self.clean(output));
        let recent = tail_chars(&clean, 500);
        self.confirm_rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(recent))
            .map(|(_, action)| action.clone())
    }

    fn detect_completion(&self, output: &str) -> Option<Completion> {
        match self.completion_strategy {
            // The session exiting is itself the completion signal.
            CompletionStrategy::ProcessExit => None,
            CompletionStrategy::PromptCount => self.detect_completion_prompt_count(output),
            CompletionStrategy::Pattern => self.detect_completion_pattern(output),
        }
    }
}
