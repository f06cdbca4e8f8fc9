//! Utility functions and helpers

pub mod ansi;
pub mod logging;
pub mod shell;
pub mod terminal;

pub use ansi::strip_ansi;
pub use logging::AgentLogger;
