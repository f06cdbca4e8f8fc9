//! Local transport: tmux on the current host with an isolated socket
//! per session.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{run_argv, valid_session_id, Transport};
use crate::utils::ansi::strip_ansi;
use crate::utils::shell;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A capture counts as empty when it has fewer printable characters
/// than this; the alternate screen is tried as a fallback.
const MIN_CAPTURE_CHARS: usize = 20;

/// Local tmux-based transport.
pub struct LocalTransport {
    socket_dir: PathBuf,
    env_setup: Option<String>,
}

impl LocalTransport {
    pub fn new(socket_dir: PathBuf, env_setup: Option<String>) -> Self {
        Self {
            socket_dir,
            env_setup,
        }
    }

    fn socket_path(&self, session_id: &str) -> String {
        self.socket_dir
            .join(format!("{}.sock", session_id))
            .to_string_lossy()
            .into_owned()
    }

    async fn run_tmux(&self, socket: &str, args: Vec<String>) -> (bool, String) {
        let mut argv = vec!["tmux".to_string(), "-S".to_string(), socket.to_string()];
        argv.extend(args);
        let outcome = run_argv(&argv, COMMAND_TIMEOUT).await;
        if outcome.success {
            (true, outcome.stdout)
        } else {
            debug!(stderr = %outcome.stderr.trim(), "tmux command failed");
            (false, outcome.stderr)
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn create_session(&self, session_id: &str, command: &[String], workdir: &str) -> bool {
        if !valid_session_id(session_id) {
            warn!(session = %session_id, "invalid session id");
            return false;
        }
        if let Err(e) = std::fs::create_dir_all(&self.socket_dir) {
            warn!(error = %e, "could not create socket directory");
            return false;
        }

        // The argv is flattened to one quoted string only here, at the
        // tmux boundary; no element can escape into shell syntax.
        let mut command_str = shell::join(command);
        if let Some(setup) = &self.env_setup {
            command_str = shell::wrap_with_setup(setup, &command_str);
        }

        let socket = self.socket_path(session_id);
        let args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            session_id.into(),
            "-c".into(),
            workdir.into(),
            command_str.clone(),
        ];
        let (ok, err) = self.run_tmux(&socket, args).await;
        if !ok {
            warn!(session = %session_id, error = %err.trim(), "failed to create session");
            return false;
        }
        info!(session = %session_id, workdir = %workdir, command = %command_str, "created session");
        true
    }

    async fn send_input(&self, session_id: &str, text: &str, send_enter: bool) -> bool {
        let socket = self.socket_path(session_id);
        let target = shell::pane_target(session_id);

        let send_args: Vec<String> = vec![
            "send-keys".into(),
            "-t".into(),
            target.clone(),
            "-l".into(),
            "--".into(),
            text.into(),
        ];
        let (ok, _) = self.run_tmux(&socket, send_args).await;
        if !ok {
            return false;
        }

        if send_enter {
            let enter_args: Vec<String> =
                vec!["send-keys".into(), "-t".into(), target, "Enter".into()];
            let (ok, _) = self.run_tmux(&socket, enter_args).await;
            return ok;
        }
        true
    }

    async fn send_key(&self, session_id: &str, key: &str) -> bool {
        let socket = self.socket_path(session_id);
        let args: Vec<String> = vec![
            "send-keys".into(),
            "-t".into(),
            shell::pane_target(session_id),
            key.into(),
        ];
        let (ok, _) = self.run_tmux(&socket, args).await;
        ok
    }

    async fn capture_output(&self, session_id: &str, lines: u32) -> String {
        let socket = self.socket_path(session_id);
        let target = shell::pane_target(session_id);

        let capture_args: Vec<String> = vec![
            "capture-pane".into(),
            "-p".into(),
            "-J".into(),
            "-t".into(),
            target.clone(),
            "-S".into(),
            format!("-{}", lines),
        ];
        let (ok, mut output) = self.run_tmux(&socket, capture_args).await;
        if !ok {
            // Expected when the session has exited.
            debug!(session = %session_id, "capture failed");
            return String::new();
        }

        // TUI tools often draw on the alternate screen, leaving the
        // primary buffer empty.
        if output.trim().len() < MIN_CAPTURE_CHARS {
            let alt_args: Vec<String> = vec![
                "capture-pane".into(),
                "-p".into(),
                "-J".into(),
                "-a".into(),
                "-t".into(),
                target,
                "-S".into(),
                format!("-{}", lines),
            ];
            let (alt_ok, alt_output) = self.run_tmux(&socket, alt_args).await;
            if alt_ok && alt_output.trim().len() > output.trim().len() {
                output = alt_output;
            }
        }

        strip_ansi(&output)
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        let socket = self.socket_path(session_id);
        let args: Vec<String> = vec!["has-session".into(), "-t".into(), session_id.into()];
        let (ok, _) = self.run_tmux(&socket, args).await;
        ok
    }

    async fn kill_session(&self, session_id: &str) -> bool {
        let socket = self.socket_path(session_id);
        let args: Vec<String> = vec!["kill-session".into(), "-t".into(), session_id.into()];
        let (ok, _) = self.run_tmux(&socket, args).await;

        let socket_file = self.socket_dir.join(format!("{}.sock", session_id));
        if let Err(e) = std::fs::remove_file(&socket_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %socket_file.display(), error = %e, "failed to remove socket");
            }
        }

        if ok {
            info!(session = %session_id, "killed session");
        }
        ok
    }

    async fn test_connection(&self) -> (bool, String) {
        let outcome = run_argv(
            &["tmux".to_string(), "-V".to_string()],
            COMMAND_TIMEOUT,
        )
        .await;
        if outcome.success {
            (
                true,
                format!("Local transport ready: {}", outcome.stdout.trim()),
            )
        } else {
            (false, "tmux binary not found in PATH".to_string())
        }
    }

    async fn latency_ms(&self) -> f64 {
        // Local round trips are free.
        0.0
    }

    fn attach_command(&self, session_id: &str) -> String {
        let socket = self.socket_path(session_id);
        format!(
            "tmux -S {} attach -t {}",
            shell::quote(&socket),
            shell::quote(session_id)
        )
    }

    async fn start_logging(&self, session_id: &str, log_path: &str) -> bool {
        let socket = self.socket_path(session_id);
        let args: Vec<String> = vec![
            "pipe-pane".into(),
            "-t".into(),
            shell::pane_target(session_id),
            format!("cat >> {}", shell::quote(log_path)),
        ];
        let (ok, _) = self.run_tmux(&socket, args).await;
        if ok {
            info!(session = %session_id, log = %log_path, "raw output logging started");
        } else {
            warn!(session = %session_id, "failed to start pipe-pane");
        }
        ok
    }
}
