//! Core data models for the Coding Agent Manager.
//!
//! All models serialize to JSON for persistence and event transport.
//! Validation happens at construction so stored records are always
//! well-formed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Upper bound on a task's total timeout: 24 hours.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Upper bound on a plausible per-run cost estimate, in dollars.
pub const MAX_COST_ESTIMATE: f64 = 1000.0;

/// How many trailing events an agent keeps in-line for debugging.
const MAX_INLINE_EVENTS: usize = 50;

/// Validation errors raised while constructing models.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("Context name must contain only alphanumeric characters, hyphens, and underscores")]
    InvalidContextName,
    #[error("Context path must be absolute")]
    RelativePath,
    #[error("Timeout cannot exceed 24 hours ({MAX_TIMEOUT_SECS} seconds)")]
    TimeoutTooLong,
    #[error("backoff_base must be greater than 1.0")]
    BackoffBaseTooSmall,
    #[error("backoff_max must be greater than or equal to backoff_base")]
    BackoffMaxTooSmall,
    #[error("Cost estimate must be between 0 and {MAX_COST_ESTIMATE}")]
    UnreasonableCost,
}

/// Agent execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
    Killed,
    Retrying,
}

impl AgentStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Killed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "killed" => Some(Self::Killed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent internal activity state. Advisory only: it feeds the UI and the
/// "has worked" predicate, never status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Initializing,
    Planning,
    Editing,
    Testing,
    Committing,
    Idle,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Editing => "editing",
            Self::Testing => "testing",
            Self::Committing => "committing",
            Self::Idle => "idle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "planning" => Some(Self::Planning),
            "editing" => Some(Self::Editing),
            "testing" => Some(Self::Testing),
            "committing" => Some(Self::Committing),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport mechanism tag, denormalized onto agents for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Local,
    Ssh,
    Websocket,
    Docker,
}

impl TransportType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Websocket => "websocket",
            Self::Docker => "docker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "ssh" => Some(Self::Ssh),
            "websocket" => Some(Self::Websocket),
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a context's sessions run. Required fields per variant
/// are enforced by the type, not by a validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MachineConfig {
    /// Multiplexer on the current host.
    Local {
        /// Shell commands to run before the tool starts (e.g. PATH setup).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_setup: Option<String>,
    },
    /// Multiplexer on a remote host reached over SSH.
    Ssh {
        host: String,
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_setup: Option<String>,
    },
    /// Multiplexer behind a long-lived agent server speaking JSON over
    /// a websocket tunnel.
    Websocket {
        host: String,
        agent_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    /// Multiplexer inside a sidecar container per session.
    Docker {
        image: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        volumes: HashMap<String, String>,
    },
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::Local { env_setup: None }
    }
}

impl MachineConfig {
    pub fn transport_type(&self) -> TransportType {
        match self {
            Self::Local { .. } => TransportType::Local,
            Self::Ssh { .. } => TransportType::Ssh,
            Self::Websocket { .. } => TransportType::Websocket,
            Self::Docker { .. } => TransportType::Docker,
        }
    }
}

/// Development context (workspace) definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Context {
    /// Create a validated context with a fresh id.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        machine: MachineConfig,
    ) -> Result<Self, ModelError> {
        let context = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            machine,
            tags: Vec::new(),
            created_at: Utc::now(),
            last_used_at: None,
        };
        context.validate()?;
        Ok(context)
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Re-check invariants, used on updates as well as construction.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.is_empty() {
            return Err(ModelError::EmptyField("name"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidContextName);
        }
        if self.path.is_empty() {
            return Err(ModelError::EmptyField("path"));
        }
        if !self.path.starts_with('/') {
            return Err(ModelError::RelativePath);
        }
        Ok(())
    }
}

/// Retry policy for task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: 2.0,
            backoff_max: 300.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: f64, backoff_max: f64) -> Result<Self, ModelError> {
        let policy = Self {
            max_retries,
            backoff_base,
            backoff_max,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.backoff_base <= 1.0 {
            return Err(ModelError::BackoffBaseTooSmall);
        }
        if self.backoff_max < self.backoff_base {
            return Err(ModelError::BackoffMaxTooSmall);
        }
        Ok(())
    }

    /// Backoff for the given attempt, capped at `backoff_max`.
    pub fn backoff_seconds(&self, attempt: u32) -> f64 {
        self.backoff_base.powi(attempt as i32).min(self.backoff_max)
    }
}

/// What an agent should do: tool, prompt, workspace, limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub tool: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Total timeout in seconds, bounded by 24 hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Explicit auto-confirm override for this task; None uses config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_confirm: Option<bool>,
    /// Stored for the task-file runner; opaque to the core.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,
}

impl TaskDefinition {
    pub fn new(tool: impl Into<String>, prompt: impl Into<String>) -> Result<Self, ModelError> {
        let task = Self {
            name: None,
            tool: tool.into(),
            prompt: prompt.into(),
            context: None,
            timeout: None,
            retry: RetryPolicy::default(),
            env: HashMap::new(),
            auto_confirm: None,
            depends_on: Vec::new(),
            on_complete: None,
        };
        task.validate()?;
        Ok(task)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Result<Self, ModelError> {
        self.timeout = Some(timeout);
        self.validate()?;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.tool.is_empty() {
            return Err(ModelError::EmptyField("tool"));
        }
        if self.prompt.is_empty() {
            return Err(ModelError::EmptyField("prompt"));
        }
        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err(ModelError::EmptyField("timeout"));
            }
            if timeout > MAX_TIMEOUT_SECS {
                return Err(ModelError::TimeoutTooLong);
            }
        }
        self.retry.validate()
    }
}

/// Event logged during agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub detail: Value,
}

impl AgentEvent {
    pub fn new(agent_id: impl Into<String>, event_type: impl Into<String>, detail: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            detail,
        }
    }
}

/// One running or finished instance of a task under supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub task: TaskDefinition,
    pub context_id: String,
    pub context_name: String,
    pub context_path: String,
    pub transport_type: TransportType,
    pub status: AgentStatus,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Trailing events kept in-line for debugging; the store holds the
    /// authoritative history.
    #[serde(default)]
    pub events: Vec<AgentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

impl Agent {
    /// Build a fresh agent for a task on a context.
    pub fn new(task: TaskDefinition, context: &Context) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            context_id: context.id.clone(),
            context_name: context.name.clone(),
            context_path: context.path.clone(),
            transport_type: context.machine.transport_type(),
            status: AgentStatus::Pending,
            state: AgentState::Initializing,
            tmux_session: None,
            tmux_socket: None,
            pid: None,
            started_at: None,
            completed_at: None,
            exit_reason: None,
            retry_count: 0,
            events: Vec::new(),
            cost_estimate: None,
            files_changed: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            AgentStatus::Starting | AgentStatus::Running | AgentStatus::Retrying
        )
    }

    /// Execution duration so far, or total if finished.
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Append to the trailing in-line event buffer.
    pub fn add_event(&mut self, event: AgentEvent) {
        self.events.push(event);
        if self.events.len() > MAX_INLINE_EVENTS {
            let excess = self.events.len() - MAX_INLINE_EVENTS;
            self.events.drain(..excess);
        }
    }

    /// Set a validated cost estimate; out-of-range values are rejected.
    pub fn set_cost_estimate(&mut self, cost: f64) -> Result<(), ModelError> {
        if !(0.0..=MAX_COST_ESTIMATE).contains(&cost) {
            return Err(ModelError::UnreasonableCost);
        }
        self.cost_estimate = Some(cost);
        Ok(())
    }
}
