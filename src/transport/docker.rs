//! Docker transport: each session gets a sidecar container with the
//! workspace mounted, and tmux runs inside it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{run_argv, valid_session_id, Transport};
use crate::utils::ansi::strip_ansi;
use crate::utils::shell;

/// Container operations include image pulls; give them more room than a
/// plain tmux call.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Docker-based transport running agents inside per-session containers.
pub struct DockerTransport {
    image: String,
    volumes: HashMap<String, String>,
}

impl DockerTransport {
    pub fn new(image: String, volumes: HashMap<String, String>) -> Self {
        Self { image, volumes }
    }

    fn container_name(&self, session_id: &str) -> String {
        format!("cam-{}", session_id)
    }

    async fn run_docker(&self, args: Vec<String>) -> (bool, String) {
        let mut argv = vec!["docker".to_string()];
        argv.extend(args);
        let outcome = run_argv(&argv, COMMAND_TIMEOUT).await;
        if outcome.success {
            (true, outcome.stdout)
        } else {
            debug!(stderr = %outcome.stderr.trim(), "docker command failed");
            (false, outcome.stderr)
        }
    }

    async fn exec_in_container(&self, container: &str, cmd: &str) -> (bool, String) {
        self.run_docker(vec![
            "exec".into(),
            container.into(),
            "bash".into(),
            "-c".into(),
            cmd.into(),
        ])
        .await
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn create_session(&self, session_id: &str, command: &[String], workdir: &str) -> bool {
        if !valid_session_id(session_id) {
            warn!(session = %session_id, "invalid session id");
            return false;
        }
        let container = self.container_name(session_id);

        let mut run_args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            container.clone(),
            "-w".into(),
            workdir.into(),
        ];
        for (host, guest) in &self.volumes {
            run_args.push("-v".into());
            run_args.push(format!("{}:{}", host, guest));
        }
        // Keep the container alive independently of the tmux session.
        run_args.extend([self.image.clone(), "sleep".into(), "infinity".into()]);

        let (ok, output) = self.run_docker(run_args).await;
        if !ok {
            warn!(container = %container, error = %output.trim(), "failed to create container");
            return false;
        }
        info!(container = %container, image = %self.image, "created container");

        // Install tmux on first use if the image lacks it.
        let _ = self
            .exec_in_container(
                &container,
                "which tmux || (apt-get update -qq && apt-get install -qq -y tmux) 2>/dev/null || \
                 (apk add --no-cache tmux) 2>/dev/null || true",
            )
            .await;

        let (ok, _) = self
            .exec_in_container(
                &container,
                &format!(
                    "tmux new-session -d -s {} -c {}",
                    shell::quote(session_id),
                    shell::quote(workdir)
                ),
            )
            .await;
        if !ok {
            warn!(container = %container, "failed to create tmux session in container");
            let _ = self
                .run_docker(vec!["rm".into(), "-f".into(), container])
                .await;
            return false;
        }

        // The launch command is typed into the session rather than being
        // its initial program; the container, not the session, carries
        // the lifetime here.
        let command_str = shell::join(command);
        if !self.send_input(session_id, &command_str, true).await {
            warn!(session = %session_id, "failed to send launch command to container");
            self.kill_session(session_id).await;
            return false;
        }
        true
    }

    async fn send_input(&self, session_id: &str, text: &str, send_enter: bool) -> bool {
        let container = self.container_name(session_id);
        let target = shell::pane_target(session_id);

        let (ok, _) = self
            .exec_in_container(
                &container,
                &format!(
                    "tmux send-keys -t {} -l -- {}",
                    shell::quote(&target),
                    shell::quote(text)
                ),
            )
            .await;
        if !ok {
            return false;
        }

        if send_enter {
            let (ok, _) = self
                .exec_in_container(
                    &container,
                    &format!("tmux send-keys -t {} Enter", shell::quote(&target)),
                )
                .await;
            return ok;
        }
        true
    }

    async fn send_key(&self, session_id: &str, key: &str) -> bool {
        let container = self.container_name(session_id);
        let (ok, _) = self
            .exec_in_container(
                &container,
                &format!(
                    "tmux send-keys -t {} {}",
                    shell::quote(&shell::pane_target(session_id)),
                    shell::quote(key)
                ),
            )
            .await;
        ok
    }

    async fn capture_output(&self, session_id: &str, lines: u32) -> String {
        let container = self.container_name(session_id);
        let (ok, output) = self
            .exec_in_container(
                &container,
                &format!(
                    "tmux capture-pane -p -J -t {} -S -{}",
                    shell::quote(&shell::pane_target(session_id)),
                    lines
                ),
            )
            .await;
        if ok {
            strip_ansi(&output)
        } else {
            String::new()
        }
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        let container = self.container_name(session_id);

        let (ok, output) = self
            .run_docker(vec![
                "inspect".into(),
                "--format".into(),
                "{{.State.Running}}".into(),
                container.clone(),
            ])
            .await;
        if !ok || output.trim() != "true" {
            return false;
        }

        let (ok, _) = self
            .exec_in_container(
                &container,
                &format!("tmux has-session -t {}", shell::quote(session_id)),
            )
            .await;
        ok
    }

    async fn kill_session(&self, session_id: &str) -> bool {
        let container = self.container_name(session_id);

        let _ = self
            .exec_in_container(
                &container,
                &format!("tmux kill-session -t {}", shell::quote(session_id)),
            )
            .await;

        let (ok, _) = self
            .run_docker(vec!["rm".into(), "-f".into(), container.clone()])
            .await;
        if ok {
            info!(container = %container, session = %session_id, "removed container");
        }
        ok
    }

    async fn test_connection(&self) -> (bool, String) {
        let (ok, output) = self
            .run_docker(vec![
                "version".into(),
                "--format".into(),
                "{{.Client.Version}}".into(),
            ])
            .await;
        if !ok {
            return (false, "Docker is not available".to_string());
        }
        let version = output.trim().to_string();

        let (image_local, _) = self
            .run_docker(vec!["image".into(), "inspect".into(), self.image.clone()])
            .await;
        if image_local {
            (
                true,
                format!("Docker {}, image '{}' available locally", version, self.image),
            )
        } else {
            (
                true,
                format!(
                    "Docker {}, image '{}' will be pulled on first use",
                    version, self.image
                ),
            )
        }
    }

    async fn latency_ms(&self) -> f64 {
        let start = Instant::now();
        let _ = self.run_docker(vec!["version".into()]).await;
        (start.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0
    }

    fn attach_command(&self, session_id: &str) -> String {
        format!(
            "docker exec -it {} tmux attach -t {}",
            shell::quote(&self.container_name(session_id)),
            shell::quote(session_id)
        )
    }
}
