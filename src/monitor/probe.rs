//! Probe-based completion detection.
//!
//! TUI tools (Claude Code, Aider, vim) put the terminal into raw mode
//! while working, which disables echo; characters typed into the pane do
//! not render. Back at a prompt, echo is restored. Sending a probe
//! character and watching for its echo is therefore a reliable binary
//! sensor for "is the tool reading stdin in cooked mode".

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::Transport;

/// Character sent into the pane. Cleaned up with BSpace when it echoes.
pub const PROBE_CHAR: &str = "Z";

/// Default settle time between sending the probe and re-capturing.
pub const PROBE_WAIT: Duration = Duration::from_millis(300);

/// Result of probing a session's terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// Probe visible on the last line: the tool is at a prompt.
    Completed,
    /// Output changed but the probe did not echo: some raw-mode reader
    /// (e.g. a confirmation menu) consumed it.
    Confirmed,
    /// Output unchanged: raw mode, echo disabled, tool is working.
    Busy,
    /// The session no longer exists.
    SessionDead,
    /// A transport call failed.
    Error,
}

impl ProbeResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Confirmed => "confirmed",
            Self::Busy => "busy",
            Self::SessionDead => "session_dead",
            Self::Error => "error",
        }
    }
}

/// Probe a session to determine whether the tool is busy or at a prompt.
pub async fn probe_session(
    transport: &dyn Transport,
    session_id: &str,
    wait: Duration,
) -> ProbeResult {
    if !transport.session_exists(session_id).await {
        return ProbeResult::SessionDead;
    }

    let baseline = transport.capture_output(session_id, 50).await;
    let baseline = baseline.trim_end_matches('\n');

    if !transport.send_input(session_id, PROBE_CHAR, false).await {
        debug!(session = %session_id, "probe send failed");
        return ProbeResult::Error;
    }

    tokio::time::sleep(wait).await;

    let after = transport.capture_output(session_id, 50).await;
    let after = after.trim_end_matches('\n');

    let last_line = after.lines().last().unwrap_or("");
    let baseline_last = baseline.lines().last().unwrap_or("");

    if last_line.contains(PROBE_CHAR) && !baseline_last.contains(PROBE_CHAR) {
        // Echo restored: the tool is at a prompt. Remove the stray char.
        if !transport.send_key(session_id, "BSpace").await {
            debug!(session = %session_id, "probe cleanup failed");
        }
        debug!(session = %session_id, "probe completed (echo visible)");
        return ProbeResult::Completed;
    }

    if after != baseline {
        debug!(session = %session_id, "probe confirmed (output changed)");
        return ProbeResult::Confirmed;
    }

    debug!(session = %session_id, "probe busy (no echo)");
    ProbeResult::Busy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;

    fn wait() -> Duration {
        Duration::from_millis(1)
    }

    #[tokio::test]
    async fn test_dead_session() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(false);
        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::SessionDead
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_error() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "❯ ".to_string());
        transport.expect_send_input().return_const(false);
        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::Error
        );
    }

    #[tokio::test]
    async fn test_echoed_probe_completes_and_cleans_up() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let mut captures = vec!["❯ \n".to_string(), "❯ Z\n".to_string()].into_iter();
        transport
            .expect_capture_output()
            .returning(move |_, _| captures.next().unwrap_or_default());
        transport.expect_send_input().return_const(true);
        transport
            .expect_send_key()
            .withf(|_, key| key == "BSpace")
            .times(1)
            .return_const(true);

        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::Completed
        );
    }

    #[tokio::test]
    async fn test_probe_already_on_baseline_not_completed() {
        // The probe char was already sitting on the old last line, so a
        // matching new last line proves nothing about echo.
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let mut captures = vec!["❯ Z\n".to_string(), "❯ Z\n".to_string()].into_iter();
        transport
            .expect_capture_output()
            .returning(move |_, _| captures.next().unwrap_or_default());
        transport.expect_send_input().return_const(true);

        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::Busy
        );
    }

    #[tokio::test]
    async fn test_consumed_probe_is_confirmed() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let mut captures = vec![
            "Do you want to proceed?\n1. Yes  2. No\n".to_string(),
            "Do you want to proceed?\nGot: Z\nContinuing work...\n".to_string(),
        ]
        .into_iter();
        transport
            .expect_capture_output()
            .returning(move |_, _| captures.next().unwrap_or_default());
        transport.expect_send_input().return_const(true);
        transport.expect_send_key().return_const(true);

        // Output changed but the probe is not the trailing echo.
        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::Confirmed
        );
    }

    #[tokio::test]
    async fn test_unchanged_output_is_busy() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "Working on your task...\n".to_string());
        transport.expect_send_input().return_const(true);

        assert_eq!(
            probe_session(&transport, "cam-x", wait()).await,
            ProbeResult::Busy
        );
    }
}
