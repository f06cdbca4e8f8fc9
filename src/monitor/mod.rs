//! Agent supervision: the per-agent monitoring loop and its helpers.
//!
//! The monitor polls a multiplexer session at a fixed cadence, detects
//! state changes, drives auto-confirmation, enforces timeouts, fires
//! completion probes, publishes lifecycle events, and finalizes the
//! agent exactly once.

pub mod probe;
pub mod retry;
pub mod runner;

pub use probe::{probe_session, ProbeResult, PROBE_CHAR, PROBE_WAIT};

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{Completion, ToolAdapter};
use crate::config::CamConfig;
use crate::events::EventBus;
use crate::models::{Agent, AgentEvent, AgentState, AgentStatus};
use crate::storage::AgentStore;
use crate::transport::Transport;
use crate::utils::logging::AgentLogger;

/// Pane lines fetched per capture.
const CAPTURE_LINES: u32 = 100;

/// Output must be stable this long before adapter completion detection
/// runs.
const COMPLETION_STABLE_SECS: f64 = 3.0;

/// Minimum spacing between auto-confirm sends, so a persistent prompt
/// is answered once.
const CONFIRM_COOLDOWN_SECS: f64 = 5.0;

/// Consecutive completed probes required to finalize.
const PROBE_STREAK: u32 = 2;

/// Monitoring loop for a single agent session.
pub struct AgentMonitor {
    agent: Agent,
    transport: Arc<dyn Transport>,
    adapter: Arc<dyn ToolAdapter>,
    store: Arc<AgentStore>,
    bus: Arc<EventBus>,
    logger: AgentLogger,
    config: CamConfig,
    cancel: CancellationToken,

    previous_output: String,
    last_change: Instant,
    last_health_check: Option<Instant>,
    last_confirm: Option<Instant>,
    last_probe: Option<Instant>,
    poll_count: u64,
    probe_count: u64,
    consecutive_completed_probes: u32,
    has_worked: bool,
    prompt_disappeared: bool,
}

impl AgentMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Agent,
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn ToolAdapter>,
        store: Arc<AgentStore>,
        bus: Arc<EventBus>,
        logger: AgentLogger,
        config: CamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            transport,
            adapter,
            store,
            bus,
            logger,
            config,
            cancel,
            previous_output: String::new(),
            last_change: Instant::now(),
            last_health_check: None,
            last_confirm: None,
            last_probe: None,
            poll_count: 0,
            probe_count: 0,
            consecutive_completed_probes: 0,
            has_worked: false,
            prompt_disappeared: false,
        }
    }

    /// The agent under supervision.
    pub(crate) fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Run the loop until the agent reaches a terminal state. Returns
    /// the agent (with final status applied) and that status.
    pub async fn run(mut self) -> (Agent, AgentStatus) {
        let Some(session_id) = self.agent.tmux_session.clone() else {
            let status = self.finalize(AgentStatus::Failed, "No TMUX session ID set").await;
            return (self.agent, status);
        };

        let poll_interval = Duration::from_secs_f64(self.config.monitor.poll_interval.max(0.01));
        let idle_timeout = self.config.monitor.idle_timeout;
        let health_interval = self.config.monitor.health_check_interval;
        let total_timeout = self.agent.task.timeout;

        // Wall-clock time already spent before this monitor attached
        // (non-zero when a detached runner re-hydrates a running agent).
        let pre_elapsed = self
            .agent
            .started_at
            .map(|t| (chrono::Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let monitor_start = Instant::now();

        self.log(
            "monitor_start",
            Some(json!({
                "session_id": session_id,
                "poll_interval": self.config.monitor.poll_interval,
                "idle_timeout": idle_timeout,
                "total_timeout": total_timeout,
            })),
            None,
        );
        self.publish("monitor_start", json!({}));

        loop {
            if self.cancel.is_cancelled() {
                self.log("cancelled", None, None);
                let status = self.finalize(AgentStatus::Killed, "Monitor cancelled").await;
                return (self.agent, status);
            }
            self.poll_count += 1;

            // 1. Total timeout.
            if let Some(limit) = total_timeout {
                let elapsed = pre_elapsed + monitor_start.elapsed().as_secs_f64();
                if elapsed >= limit as f64 {
                    self.log(
                        "timeout",
                        Some(json!({"elapsed": elapsed, "limit": limit})),
                        None,
                    );
                    self.publish("timeout", json!({"elapsed": elapsed, "limit": limit}));
                    self.transport.kill_session(&session_id).await;
                    let status = self
                        .finalize(
                            AgentStatus::Timeout,
                            &format!("Total timeout after {:.0}s", elapsed),
                        )
                        .await;
                    return (self.agent, status);
                }
            }

            // 2. Idle timeout.
            if idle_timeout > 0 {
                let idle = self.last_change.elapsed().as_secs_f64();
                if idle >= idle_timeout as f64 {
                    self.log(
                        "idle_timeout",
                        Some(json!({"idle_seconds": idle, "limit": idle_timeout})),
                        None,
                    );
                    self.publish(
                        "idle_timeout",
                        json!({"idle_seconds": idle, "limit": idle_timeout}),
                    );
                    self.transport.kill_session(&session_id).await;
                    let status = self
                        .finalize(
                            AgentStatus::Timeout,
                            &format!("Idle timeout after {:.0}s with no output change", idle),
                        )
                        .await;
                    return (self.agent, status);
                }
            }

            // 3. Health check, every N seconds rather than every tick.
            let due = self
                .last_health_check
                .map_or(true, |t| t.elapsed().as_secs_f64() >= health_interval as f64);
            if due {
                self.last_health_check = Some(Instant::now());
                if !self.transport.session_exists(&session_id).await {
                    self.log("session_gone", Some(json!({"session_id": session_id})), None);
                    self.publish("session_gone", json!({"session_id": session_id}));
                    // The session exiting on its own is success unless the
                    // last capture carries an error verdict; either way
                    // the source treats exit as completion.
                    let reason = if !self.previous_output.is_empty()
                        && self.adapter.detect_completion(&self.previous_output)
                            == Some(Completion::Completed)
                    {
                        "Session ended cleanly"
                    } else {
                        "TMUX session exited"
                    };
                    let status = self.finalize(AgentStatus::Completed, reason).await;
                    return (self.agent, status);
                }
            }

            // 4. Capture.
            let output = self.transport.capture_output(&session_id, CAPTURE_LINES).await;

            // 5. Change detection.
            let output_changed = output != self.previous_output;
            if output_changed {
                self.last_change = Instant::now();
                self.log("output", None, Some(output.clone()));
                self.publish("output", json!({"chars": output.len()}));
            }
            self.previous_output = output.clone();

            if output.trim().is_empty() {
                // A tick with no signal.
                if self.sleep_or_cancel(poll_interval).await {
                    continue;
                }
                let status = self.finalize(AgentStatus::Killed, "Monitor cancelled").await;
                return (self.agent, status);
            }

            // 6. Auto-confirm, on changed output, outside the cooldown.
            let auto_confirm = self
                .agent
                .task
                .auto_confirm
                .unwrap_or(self.config.general.auto_confirm);
            if output_changed && auto_confirm {
                let cooled = self
                    .last_confirm
                    .map_or(true, |t| t.elapsed().as_secs_f64() >= CONFIRM_COOLDOWN_SECS);
                if cooled {
                    if let Some(action) = self.adapter.should_auto_confirm(&output) {
                        self.last_confirm = Some(Instant::now());
                        let detail = json!({
                            "response": action.response,
                            "send_enter": action.send_enter,
                        });
                        self.log("auto_confirm", Some(detail.clone()), None);
                        self.publish("auto_confirm", detail);
                        self.transport
                            .send_input(&session_id, &action.response, action.send_enter)
                            .await;
                        // Give the tool a moment to process the answer.
                        if !self.sleep_or_cancel(Duration::from_millis(500)).await {
                            let status =
                                self.finalize(AgentStatus::Killed, "Monitor cancelled").await;
                            return (self.agent, status);
                        }
                        continue;
                    }
                }
            }

            // 7. State detection.
            if let Some(new_state) = self.adapter.detect_state(&output) {
                if new_state != self.agent.state {
                    if new_state != AgentState::Initializing {
                        self.has_worked = true;
                    }
                    let old_state = self.agent.state;
                    self.agent.state = new_state;
                    if let Err(e) = self.store.update_status(
                        &self.agent.id,
                        self.agent.status,
                        Some(new_state),
                        None,
                    ) {
                        warn!(agent = %self.agent.id, error = %e, "failed to persist state");
                    }
                    let detail = json!({"from": old_state.as_str(), "to": new_state.as_str()});
                    self.log("state_change", Some(detail.clone()), None);
                    self.publish("state_change", detail);
                }
            }

            // 8. Adapter completion, only once output has stabilized.
            let idle_for = self.last_change.elapsed().as_secs_f64();
            if !output_changed && idle_for >= COMPLETION_STABLE_SECS {
                if let Some(completion) = self.adapter.detect_completion(&output) {
                    if let Some(cost) = self.adapter.estimate_cost(&output) {
                        let _ = self.agent.set_cost_estimate(cost);
                    }
                    let files = self.adapter.parse_files_changed(&output);
                    if !files.is_empty() {
                        self.agent.files_changed = files;
                    }
                    let (status, reason) = match completion {
                        Completion::Completed => (AgentStatus::Completed, "completed"),
                        Completion::Failed => (AgentStatus::Failed, "failed"),
                    };
                    let status = self.finalize(status, reason).await;
                    return (self.agent, status);
                }
            }

            // 9. Completion via prompt return, for tools that type the
            // prompt after launch. Requires the prompt to have first
            // disappeared so the startup screen cannot false-positive.
            if self.adapter.needs_prompt_after_launch() {
                let prompt_visible = self.adapter.is_ready_for_input(&output);
                if !prompt_visible && self.has_worked {
                    self.prompt_disappeared = true;
                }
                if prompt_visible && self.has_worked && self.prompt_disappeared {
                    self.log(
                        "prompt_return_completion",
                        Some(json!({"state": self.agent.state.as_str()})),
                        None,
                    );
                    self.publish(
                        "prompt_return_completion",
                        json!({"state": self.agent.state.as_str()}),
                    );
                    let status = self
                        .finalize(AgentStatus::Completed, "Tool returned to input prompt")
                        .await;
                    return (self.agent, status);
                }
            }

            // 10. Completion via probe.
            if self.probe_due(idle_for) {
                self.last_probe = Some(Instant::now());
                self.probe_count += 1;
                let result =
                    probe_session(self.transport.as_ref(), &session_id, PROBE_WAIT).await;

                match result {
                    ProbeResult::Completed => self.consecutive_completed_probes += 1,
                    ProbeResult::Busy => {
                        // The tool is provably working; suppress false
                        // idle timeouts.
                        self.consecutive_completed_probes = 0;
                        self.last_change = Instant::now();
                    }
                    _ => self.consecutive_completed_probes = 0,
                }

                let detail = json!({
                    "result": result.as_str(),
                    "probe_count": self.probe_count,
                    "consecutive_completed": self.consecutive_completed_probes,
                });
                self.log("probe", Some(detail.clone()), None);
                self.publish("probe", detail);

                if self.consecutive_completed_probes >= PROBE_STREAK {
                    let status = self
                        .finalize(
                            AgentStatus::Completed,
                            "Probe detected agent at prompt (echo mode)",
                        )
                        .await;
                    return (self.agent, status);
                }
            }

            // 11. Sleep until the next poll.
            if !self.sleep_or_cancel(poll_interval).await {
                self.log("cancelled", None, None);
                let status = self.finalize(AgentStatus::Killed, "Monitor cancelled").await;
                return (self.agent, status);
            }
        }
    }

    /// Whether all probe gates are open this tick.
    fn probe_due(&self, idle_for: f64) -> bool {
        if !self.config.monitor.probe_detection || !self.has_worked {
            return false;
        }
        if idle_for < self.config.monitor.probe_stable_seconds as f64 {
            return false;
        }
        self.last_probe
            .map_or(true, |t| {
                t.elapsed().as_secs_f64() >= self.config.monitor.probe_cooldown as f64
            })
    }

    /// Sleep, returning false if cancelled mid-sleep.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn log(&mut self, event_type: &str, data: Option<serde_json::Value>, output: Option<String>) {
        self.logger.write(event_type, data, output);
    }

    /// Create, record, persist, and broadcast one event.
    fn publish(&mut self, event_type: &str, detail: serde_json::Value) {
        let event = AgentEvent::new(self.agent.id.clone(), event_type, detail);
        self.agent.add_event(event.clone());
        if let Err(e) = self.store.add_event(&event) {
            warn!(agent = %self.agent.id, event = %event_type, error = %e,
                  "failed to persist event");
        }
        self.bus.publish(&event);
    }

    /// Assign a terminal status, persist, log, and broadcast. A second
    /// call is a no-op because the status is already terminal.
    async fn finalize(&mut self, status: AgentStatus, reason: &str) -> AgentStatus {
        if self.agent.is_terminal() {
            return self.agent.status;
        }
        self.agent.status = status;
        self.agent.completed_at = Some(chrono::Utc::now());
        self.agent.exit_reason = Some(reason.to_string());

        if let Err(e) = self.store.save(&self.agent) {
            warn!(agent = %self.agent.id, error = %e, "failed to persist final status");
        }

        let duration = self.agent.duration_seconds();
        self.log(
            "finalize",
            Some(json!({
                "status": status.as_str(),
                "reason": reason,
                "duration_seconds": duration,
                "poll_count": self.poll_count,
                "cost_estimate": self.agent.cost_estimate,
                "files_changed": self.agent.files_changed,
            })),
            None,
        );
        self.publish(
            "agent_finished",
            json!({
                "status": status.as_str(),
                "reason": reason,
                "duration_seconds": duration,
            }),
        );

        info!(
            agent = %self.agent.id,
            status = %status,
            reason = %reason,
            duration = duration.unwrap_or(0.0),
            "agent finalized"
        );
        status
    }
}
