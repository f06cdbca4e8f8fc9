//! Hierarchical configuration for CAM.
//!
//! Sources are merged in priority order, later overriding earlier:
//! 1. Built-in defaults
//! 2. Global config: `~/.config/cam/config.toml`
//! 3. Project config: `.cam/config.toml`, searched upward from CWD
//! 4. Environment variables with the `CAM_` prefix
//! 5. Caller-supplied overrides
//!
//! Merging is recursive on tables, so a project file can override a
//! single key without restating its section. The `tools` map merges by
//! tool name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::paths::{Paths, PROJECT_CONFIG};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(toml::de::Error),
    #[error("Invalid duration format: {0}. Expected format: '30', '30s', '5m', '2h', or '1d'")]
    InvalidDuration(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnvValue { var: &'static str, value: String },
}

/// General CAM settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub default_tool: String,
    /// Duration string, e.g. "30m", "2h", "1d".
    pub default_timeout: String,
    pub auto_confirm: bool,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_tool: "claude".to_string(),
            default_timeout: "30m".to_string(),
            auto_confirm: true,
            log_level: "info".to_string(),
        }
    }
}

/// Supervision loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between polls. Fractional values are honored.
    pub poll_interval: f64,
    /// Seconds without output change before a timeout; 0 disables.
    pub idle_timeout: u64,
    /// Seconds between session liveness checks.
    pub health_check_interval: u64,
    pub probe_detection: bool,
    /// Seconds of stable output required before the first probe.
    pub probe_stable_seconds: u64,
    /// Minimum seconds between probes.
    pub probe_cooldown: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: 2.0,
            idle_timeout: 300,
            health_check_interval: 30,
            probe_detection: true,
            probe_stable_seconds: 10,
            probe_cooldown: 20,
        }
    }
}

/// Retry and backoff defaults for tasks that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_max: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: 2.0,
            backoff_max: 300.0,
        }
    }
}

/// Path overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub log_dir: Option<String>,
}

/// Per-tool configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub default_args: Vec<String>,
    pub auto_confirm_patterns: Vec<String>,
}

/// Root configuration model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamConfig {
    pub general: GeneralConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub paths: PathsConfig,
    pub tools: HashMap<String, ToolConfig>,
}

impl CamConfig {
    /// Load and merge configuration from all sources.
    pub fn load(paths: &Paths, overrides: Option<toml::Table>) -> Result<Self, ConfigError> {
        Self::load_from(paths, std::env::current_dir().ok().as_deref(), overrides)
    }

    /// Load with an explicit working directory for project discovery
    /// (injectable for tests).
    pub fn load_from(
        paths: &Paths,
        cwd: Option<&Path>,
        overrides: Option<toml::Table>,
    ) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        if let Some(table) = load_toml(&paths.global_config()) {
            merge_tables(&mut merged, table);
        }
        if let Some(project_path) = cwd.and_then(find_project_config) {
            if let Some(table) = load_toml(&project_path) {
                merge_tables(&mut merged, table);
            }
        }
        apply_env_vars(&mut merged)?;
        if let Some(table) = overrides {
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(ConfigError::Invalid)
    }

    /// The effective default total timeout in seconds, if parseable.
    pub fn default_timeout_seconds(&self) -> Option<u64> {
        parse_duration(&self.general.default_timeout).ok().flatten()
    }
}

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([smhd])$").expect("duration regex"));

/// Parse a duration string into seconds.
///
/// Accepts a plain number of seconds (`"600"`) or a number with a unit
/// suffix (`"30s"`, `"5m"`, `"2h"`, `"1d"`). Empty input is `None`;
/// anything else is an error.
pub fn parse_duration(s: &str) -> Result<Option<u64>, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidDuration(s.to_string()));
    }
    let lower = s.to_lowercase();
    let captures = DURATION_RE
        .captures(&lower)
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))?;
    let value: f64 = captures[1]
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    let unit = match &captures[2] {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86_400.0,
        _ => unreachable!("regex limits units"),
    };
    Ok(Some((value * unit) as u64))
}

/// Load one TOML source. Unreadable or malformed files are warned about
/// and skipped so a broken config source never takes the process down.
fn load_toml(path: &Path) -> Option<toml::Table> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable config file");
            return None;
        }
    };
    match contents.parse() {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping malformed config file");
            None
        }
    }
}

fn find_project_config(cwd: &Path) -> Option<PathBuf> {
    let mut current = Some(cwd);
    while let Some(dir) = current {
        let candidate = dir.join(PROJECT_CONFIG);
        if candidate.exists() {
            return Some(candidate);
        }
        current = dir.parent();
    }
    None
}

/// Deep-merge `override_table` into `base`. Tables merge recursively;
/// scalars and arrays are replaced.
fn merge_tables(base: &mut toml::Table, override_table: toml::Table) {
    for (key, value) in override_table {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

enum EnvKind {
    Str,
    Bool,
    Int,
    Float,
}

/// Explicit environment variable table: each recognized `CAM_*` name maps
/// to one config key with a declared type.
const ENV_MAPPINGS: &[(&str, &str, &str, EnvKind)] = &[
    ("CAM_DEFAULT_TOOL", "general", "default_tool", EnvKind::Str),
    (
        "CAM_DEFAULT_TIMEOUT",
        "general",
        "default_timeout",
        EnvKind::Str,
    ),
    ("CAM_AUTO_CONFIRM", "general", "auto_confirm", EnvKind::Bool),
    ("CAM_LOG_LEVEL", "general", "log_level", EnvKind::Str),
    ("CAM_POLL_INTERVAL", "monitor", "poll_interval", EnvKind::Float),
    ("CAM_IDLE_TIMEOUT", "monitor", "idle_timeout", EnvKind::Int),
    (
        "CAM_HEALTH_CHECK_INTERVAL",
        "monitor",
        "health_check_interval",
        EnvKind::Int,
    ),
    (
        "CAM_PROBE_DETECTION",
        "monitor",
        "probe_detection",
        EnvKind::Bool,
    ),
    (
        "CAM_PROBE_STABLE_SECONDS",
        "monitor",
        "probe_stable_seconds",
        EnvKind::Int,
    ),
    ("CAM_PROBE_COOLDOWN", "monitor", "probe_cooldown", EnvKind::Int),
    ("CAM_MAX_RETRIES", "retry", "max_retries", EnvKind::Int),
    ("CAM_BACKOFF_BASE", "retry", "backoff_base", EnvKind::Float),
    ("CAM_BACKOFF_MAX", "retry", "backoff_max", EnvKind::Float),
    ("CAM_LOG_DIR", "paths", "log_dir", EnvKind::Str),
];

fn apply_env_vars(config: &mut toml::Table) -> Result<(), ConfigError> {
    for (var, section, key, kind) in ENV_MAPPINGS {
        let Ok(raw) = std::env::var(var) else {
            continue;
        };
        let value = match kind {
            EnvKind::Str => toml::Value::String(raw),
            EnvKind::Bool => toml::Value::Boolean(matches!(
                raw.to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )),
            EnvKind::Int => {
                toml::Value::Integer(raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
                    var: *var,
                    value: raw.clone(),
                })?)
            }
            EnvKind::Float => {
                toml::Value::Float(raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
                    var: *var,
                    value: raw.clone(),
                })?)
            }
        };
        let entry = config
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(table) = entry {
            table.insert(key.to_string(), value);
        }
    }
    Ok(())
}
