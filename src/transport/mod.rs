//! Transport layer: a uniform API over a terminal multiplexer, wherever
//! it runs.
//!
//! Every operation either succeeds or returns a negative result. Errors
//! from the underlying channel (connection reset, missing binary,
//! command timeout) are logged and absorbed; the monitor treats a failed
//! call as a tick with no signal, never as a crash.

mod docker;
mod local;
mod ssh;
mod websocket;

pub use docker::DockerTransport;
pub use local::LocalTransport;
pub use ssh::SshTransport;
pub use websocket::WebSocketTransport;

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error};

use crate::models::MachineConfig;
use crate::paths::Paths;

/// Session ids must stay shell- and tmux-safe.
static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("session id regex"));

/// Check a session id against the allowed alphabet.
pub fn valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

/// Execution backend for multiplexer sessions.
///
/// All session operations go through tmux; implementations differ only
/// in where tmux runs and how commands reach it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a session named `session_id` whose initial program is
    /// `command` (an argv, joined with shell quoting only at the tmux
    /// boundary). When the program exits, the session exits.
    async fn create_session(&self, session_id: &str, command: &[String], workdir: &str) -> bool;

    /// Send text byte-for-byte (literal mode), then optionally Enter as
    /// a separate key.
    async fn send_input(&self, session_id: &str, text: &str, send_enter: bool) -> bool;

    /// Send a named key (`BSpace`, `Enter`, `Escape`, ...), not literal.
    async fn send_key(&self, session_id: &str, key: &str) -> bool;

    /// Capture the last `lines` of visible pane text, wrapped lines
    /// joined, ANSI stripped. Empty on failure.
    async fn capture_output(&self, session_id: &str, lines: u32) -> String;

    /// Whether the session is still alive.
    async fn session_exists(&self, session_id: &str) -> bool;

    /// Kill the session and clean up its socket.
    async fn kill_session(&self, session_id: &str) -> bool;

    /// Verify the backend is reachable. Returns success plus a
    /// human-readable detail line.
    async fn test_connection(&self) -> (bool, String);

    /// Round-trip latency in milliseconds.
    async fn latency_ms(&self) -> f64;

    /// Shell command a user can paste to join the session interactively.
    fn attach_command(&self, session_id: &str) -> String;

    /// Pipe the raw pane stream to a log file. Backends without raw
    /// logging report failure.
    async fn start_logging(&self, _session_id: &str, _log_path: &str) -> bool {
        false
    }

    /// Incrementally read the raw output log from `offset`, returning
    /// the chunk and the next offset.
    async fn read_output_log(
        &self,
        _session_id: &str,
        offset: u64,
        _max_bytes: u64,
    ) -> (String, u64) {
        (String::new(), offset)
    }
}

/// Creates Transport instances from machine configuration.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(machine: &MachineConfig, paths: &Paths) -> std::sync::Arc<dyn Transport> {
        match machine {
            MachineConfig::Local { env_setup } => std::sync::Arc::new(LocalTransport::new(
                paths.socket_dir(),
                env_setup.clone(),
            )),
            MachineConfig::Ssh {
                host,
                user,
                port,
                key_file,
                env_setup,
            } => std::sync::Arc::new(SshTransport::new(
                host.clone(),
                user.clone(),
                *port,
                key_file.clone(),
                env_setup.clone(),
            )),
            MachineConfig::Websocket {
                host,
                agent_port,
                auth_token,
            } => std::sync::Arc::new(WebSocketTransport::new(
                host.clone(),
                *agent_port,
                auth_token.clone(),
            )),
            MachineConfig::Docker { image, volumes } => {
                std::sync::Arc::new(DockerTransport::new(image.clone(), volumes.clone()))
            }
        }
    }
}

/// Outcome of a subprocess run: success flag, stdout, stderr.
pub(crate) struct RunOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run an argv with a timeout, capturing output. Failures (spawn error,
/// timeout, non-zero exit) come back as `success: false` with whatever
/// detail is available; nothing is raised.
pub(crate) async fn run_argv(argv: &[String], timeout: Duration) -> RunOutcome {
    debug!(command = %argv.join(" "), "running");
    let Some((program, args)) = argv.split_first() else {
        return RunOutcome {
            success: false,
            stdout: String::new(),
            stderr: "empty command".to_string(),
        };
    };

    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            error!(program = %program, error = %e, "failed to spawn");
            return RunOutcome {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
            };
        }
        Err(_) => {
            error!(program = %program, "command timed out");
            return RunOutcome {
                success: false,
                stdout: String::new(),
                stderr: "command timed out".to_string(),
            };
        }
    };

    RunOutcome {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}
