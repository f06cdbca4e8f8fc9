//! SSH transport: tmux on a remote host, every call tunneled through a
//! pooled ControlMaster connection.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{run_argv, valid_session_id, Transport};
use crate::paths::{REMOTE_LOG_DIR, REMOTE_SOCKET_DIR};
use crate::utils::ansi::strip_ansi;
use crate::utils::shell;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_CAPTURE_CHARS: usize = 20;

/// SSH-based transport with ControlMaster connection pooling.
pub struct SshTransport {
    host: String,
    user: String,
    port: u16,
    key_file: Option<String>,
    env_setup: Option<String>,
    control_path: PathBuf,
}

impl SshTransport {
    pub fn new(
        host: String,
        user: String,
        port: Option<u16>,
        key_file: Option<String>,
        env_setup: Option<String>,
    ) -> Self {
        let port = port.unwrap_or(22);
        // The control socket path must stay short: the OS caps Unix
        // socket names around 108 bytes and SSH appends a random
        // suffix. A hash of the connection tuple keeps it stable and
        // small.
        let conn_key = format!("{}@{}:{}", user, host, port);
        let digest = Sha256::digest(conn_key.as_bytes());
        let conn_hash: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
        let control_path = PathBuf::from(format!("/tmp/cam-ssh-{}", conn_hash));
        Self {
            host,
            user,
            port,
            key_file,
            env_setup,
            control_path,
        }
    }

    fn ssh_base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "ssh".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            "ConnectTimeout=10".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            "ControlPersist=600".into(),
        ];
        if self.port != 22 {
            args.push("-p".into());
            args.push(self.port.to_string());
        }
        if let Some(key) = &self.key_file {
            args.push("-i".into());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    async fn run_ssh(&self, remote_cmd: &str) -> (bool, String) {
        let mut argv = self.ssh_base_args();
        argv.push("--".into());
        argv.push(remote_cmd.to_string());

        let outcome = run_argv(&argv, COMMAND_TIMEOUT).await;
        if outcome.success {
            (true, outcome.stdout)
        } else {
            debug!(host = %self.host, stderr = %outcome.stderr.trim(), "ssh command failed");
            (false, outcome.stderr)
        }
    }

    /// Build a remote tmux command string against the session's socket
    /// under the fixed remote socket directory.
    fn remote_tmux_cmd(&self, session_id: &str, tmux_args: &[String]) -> String {
        let socket = format!("{}/{}.sock", REMOTE_SOCKET_DIR, session_id);
        let mut parts = vec![
            "tmux".to_string(),
            "-S".to_string(),
            shell::quote(&socket),
        ];
        parts.extend(tmux_args.iter().map(|a| shell::quote(a)));
        parts.join(" ")
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn create_session(&self, session_id: &str, command: &[String], workdir: &str) -> bool {
        if !valid_session_id(session_id) {
            warn!(session = %session_id, "invalid session id");
            return false;
        }

        let (ok, _) = self
            .run_ssh(&format!("mkdir -p {}", REMOTE_SOCKET_DIR))
            .await;
        if !ok {
            warn!(host = %self.host, "could not create remote socket dir");
        }

        let mut command_str = shell::join(command);
        if let Some(setup) = &self.env_setup {
            command_str = shell::wrap_with_setup(setup, &command_str);
        }

        let create_cmd = self.remote_tmux_cmd(
            session_id,
            &[
                "new-session".into(),
                "-d".into(),
                "-s".into(),
                session_id.into(),
                "-c".into(),
                workdir.into(),
                command_str,
            ],
        );
        let (ok, err) = self.run_ssh(&create_cmd).await;
        if !ok {
            warn!(session = %session_id, host = %self.host, error = %err.trim(),
                  "failed to create remote session");
            return false;
        }
        info!(session = %session_id, host = %self.host, workdir = %workdir,
              "created remote session");
        true
    }

    async fn send_input(&self, session_id: &str, text: &str, send_enter: bool) -> bool {
        let target = shell::pane_target(session_id);

        if !text.is_empty() {
            let cmd = if text.is_ascii() {
                self.remote_tmux_cmd(
                    session_id,
                    &[
                        "send-keys".into(),
                        "-t".into(),
                        target.clone(),
                        "-l".into(),
                        "--".into(),
                        text.into(),
                    ],
                )
            } else {
                // Non-ASCII bytes get mangled by POSIX-locale remote
                // shells; transport them through a base64 round trip.
                let b64 = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
                let socket = format!("{}/{}.sock", REMOTE_SOCKET_DIR, session_id);
                format!(
                    "bash -c 'tmux -S {} send-keys -t {} -l -- \"$(echo {} | base64 -d)\"'",
                    shell::quote(&socket),
                    shell::quote(&target),
                    b64
                )
            };
            let (ok, _) = self.run_ssh(&cmd).await;
            if !ok {
                return false;
            }
        }

        if send_enter {
            let cmd = self.remote_tmux_cmd(
                session_id,
                &["send-keys".into(), "-t".into(), target, "Enter".into()],
            );
            let (ok, _) = self.run_ssh(&cmd).await;
            return ok;
        }
        true
    }

    async fn send_key(&self, session_id: &str, key: &str) -> bool {
        let cmd = self.remote_tmux_cmd(
            session_id,
            &[
                "send-keys".into(),
                "-t".into(),
                shell::pane_target(session_id),
                key.into(),
            ],
        );
        let (ok, _) = self.run_ssh(&cmd).await;
        ok
    }

    async fn capture_output(&self, session_id: &str, lines: u32) -> String {
        let target = shell::pane_target(session_id);
        let capture_cmd = self.remote_tmux_cmd(
            session_id,
            &[
                "capture-pane".into(),
                "-p".into(),
                "-J".into(),
                "-t".into(),
                target.clone(),
                "-S".into(),
                format!("-{}", lines),
            ],
        );
        let (ok, mut output) = self.run_ssh(&capture_cmd).await;
        if !ok {
            debug!(session = %session_id, "remote capture failed");
            return String::new();
        }

        if output.trim().len() < MIN_CAPTURE_CHARS {
            let alt_cmd = self.remote_tmux_cmd(
                session_id,
                &[
                    "capture-pane".into(),
                    "-p".into(),
                    "-J".into(),
                    "-a".into(),
                    "-t".into(),
                    target,
                    "-S".into(),
                    format!("-{}", lines),
                ],
            );
            let (alt_ok, alt_output) = self.run_ssh(&alt_cmd).await;
            if alt_ok && alt_output.trim().len() > output.trim().len() {
                output = alt_output;
            }
        }

        strip_ansi(&output)
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        let cmd = self.remote_tmux_cmd(
            session_id,
            &["has-session".into(), "-t".into(), session_id.into()],
        );
        let (ok, _) = self.run_ssh(&cmd).await;
        ok
    }

    async fn kill_session(&self, session_id: &str) -> bool {
        let cmd = self.remote_tmux_cmd(
            session_id,
            &["kill-session".into(), "-t".into(), session_id.into()],
        );
        let (ok, _) = self.run_ssh(&cmd).await;

        let socket = format!("{}/{}.sock", REMOTE_SOCKET_DIR, session_id);
        let _ = self.run_ssh(&format!("rm -f {}", shell::quote(&socket))).await;

        if ok {
            info!(session = %session_id, host = %self.host, "killed remote session");
        }
        ok
    }

    async fn test_connection(&self) -> (bool, String) {
        let (ok, output) = self.run_ssh("echo ok && tmux -V").await;
        if !ok {
            return (
                false,
                format!("Cannot connect to {}@{}:{}", self.user, self.host, self.port),
            );
        }
        let lines: Vec<&str> = output.trim().lines().collect();
        match lines.as_slice() {
            [first, version, ..] if first.trim() == "ok" => (
                true,
                format!("SSH connected to {}: {}", self.host, version.trim()),
            ),
            [first] if first.trim() == "ok" => (
                false,
                format!("SSH connected to {} but tmux not found", self.host),
            ),
            _ => (
                false,
                format!(
                    "Unexpected response from {}: {}",
                    self.host,
                    &output[..output.len().min(100)]
                ),
            ),
        }
    }

    async fn latency_ms(&self) -> f64 {
        let start = Instant::now();
        let _ = self.run_ssh("true").await;
        (start.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0
    }

    fn attach_command(&self, session_id: &str) -> String {
        let socket = format!("{}/{}.sock", REMOTE_SOCKET_DIR, session_id);
        let mut parts: Vec<String> = vec!["ssh".into()];
        if self.port != 22 {
            parts.push("-p".into());
            parts.push(self.port.to_string());
        }
        if let Some(key) = &self.key_file {
            parts.push("-i".into());
            parts.push(key.clone());
        }
        // -t forces a pseudo-terminal for the interactive attach.
        parts.push("-t".into());
        parts.push(format!("{}@{}", self.user, self.host));
        parts.push(format!(
            "tmux -S {} attach -t {}",
            shell::quote(&socket),
            shell::quote(session_id)
        ));
        parts
            .iter()
            .map(|p| {
                if p.contains(' ') {
                    shell::quote(p)
                } else {
                    p.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn start_logging(&self, session_id: &str, _log_path: &str) -> bool {
        let _ = self.run_ssh(&format!("mkdir -p {}", REMOTE_LOG_DIR)).await;
        let remote_log = format!("{}/{}.output.log", REMOTE_LOG_DIR, session_id);
        let cmd = self.remote_tmux_cmd(
            session_id,
            &[
                "pipe-pane".into(),
                "-t".into(),
                shell::pane_target(session_id),
                format!("cat >> {}", remote_log),
            ],
        );
        let (ok, _) = self.run_ssh(&cmd).await;
        if ok {
            info!(session = %session_id, log = %remote_log, "remote raw logging started");
        } else {
            warn!(session = %session_id, "failed to start remote pipe-pane");
        }
        ok
    }

    async fn read_output_log(&self, session_id: &str, offset: u64, max_bytes: u64) -> (String, u64) {
        let remote_log = format!("{}/{}.output.log", REMOTE_LOG_DIR, session_id);
        let cmd = format!(
            "dd if={} bs=1 skip={} count={} 2>/dev/null",
            shell::quote(&remote_log),
            offset,
            max_bytes
        );
        let (ok, output) = self.run_ssh(&cmd).await;
        if !ok || output.is_empty() {
            return (String::new(), offset);
        }
        let next = offset + output.len() as u64;
        (output, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transport() -> SshTransport {
        SshTransport::new(
            "remote.example.com".into(),
            "dev".into(),
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_control_path_is_short_and_stable() {
        let a = transport();
        let b = transport();
        assert_eq!(a.control_path, b.control_path);
        assert!(a.control_path.to_string_lossy().len() < 40);
        assert!(a.control_path.to_string_lossy().starts_with("/tmp/cam-ssh-"));

        let other = SshTransport::new(
            "remote.example.com".into(),
            "dev".into(),
            Some(2222),
            None,
            None,
        );
        assert_ne!(a.control_path, other.control_path);
    }

    #[test]
    fn test_base_args_default_port_omitted() {
        let t = transport();
        let args = t.ssh_base_args();
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(args.last().unwrap(), "dev@remote.example.com");
    }

    #[test]
    fn test_base_args_custom_port_and_key() {
        let t = SshTransport::new(
            "h".into(),
            "u".into(),
            Some(2200),
            Some("/home/u/.ssh/id_ed25519".into()),
            None,
        );
        let args = t.ssh_base_args();
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2200");
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/u/.ssh/id_ed25519");
    }

    #[test]
    fn test_remote_tmux_cmd_quotes_socket() {
        let t = transport();
        let cmd = t.remote_tmux_cmd(
            "cam-abc",
            &["has-session".into(), "-t".into(), "cam-abc".into()],
        );
        assert_eq!(
            cmd,
            "tmux -S /tmp/cam-sockets/cam-abc.sock has-session -t cam-abc"
        );
    }

    #[test]
    fn test_attach_command_shape() {
        let t = transport();
        let cmd = t.attach_command("cam-abc");
        assert!(cmd.starts_with("ssh -t dev@remote.example.com"));
        assert!(cmd.contains("attach -t cam-abc"));
    }
}
