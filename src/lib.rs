//! CAM - Coding Agent Manager
//!
//! A process supervisor and control plane for long-running, interactive
//! AI coding tools (Claude Code, Codex, Aider, and arbitrary CLIs).
//! Tasks are launched into isolated terminal-multiplexer sessions and
//! driven to completion by parsing pane output: permission prompts are
//! auto-confirmed, timeouts and retries enforced, and structured
//! lifecycle events published for streaming consumers.

pub mod adapters;
pub mod config;
pub mod events;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod paths;
pub mod storage;
pub mod transport;
pub mod utils;

pub use manager::{AgentManager, ManagerError};
pub use models::{
    Agent, AgentEvent, AgentState, AgentStatus, Context, MachineConfig, RetryPolicy,
    TaskDefinition, TransportType,
};
