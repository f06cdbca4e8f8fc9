//! Retry loop around the monitor, shared by the in-process follow path
//! and the detached runner.
//!
//! Only `failed` results re-enter the loop; timeouts and kills are not
//! transient. Each retry backs off exponentially, kills any leftover
//! session, re-creates it under the same name, re-sends the prompt for
//! interactive tools, and resets the agent to `running`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::ToolAdapter;
use crate::config::CamConfig;
use crate::events::EventBus;
use crate::models::{Agent, AgentEvent, AgentState, AgentStatus, Context};
use crate::monitor::AgentMonitor;
use crate::storage::AgentStore;
use crate::transport::Transport;
use crate::utils::logging::AgentLogger;

/// Poll cadence of the readiness wait after launch.
const READY_POLL: Duration = Duration::from_secs(1);

/// Settle time after answering a pre-prompt confirmation.
const CONFIRM_SETTLE: Duration = Duration::from_secs(3);

/// Dependencies threaded through the retry loop.
pub struct MonitorDeps {
    pub transport: Arc<dyn Transport>,
    pub adapter: Arc<dyn ToolAdapter>,
    pub store: Arc<AgentStore>,
    pub bus: Arc<EventBus>,
    pub config: CamConfig,
    pub log_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// Run the monitor until a terminal result, retrying failures within
/// the task's retry budget.
pub async fn run_with_retries(
    mut agent: Agent,
    context: &Context,
    deps: &MonitorDeps,
) -> (Agent, AgentStatus) {
    let max_retries = agent.task.retry.max_retries;

    loop {
        let mut logger = AgentLogger::new(agent.id.clone(), deps.log_dir.clone());
        if let Err(e) = logger.open() {
            warn!(agent = %agent.id, error = %e, "could not open agent log");
        }

        let monitor = AgentMonitor::new(
            agent,
            deps.transport.clone(),
            deps.adapter.clone(),
            deps.store.clone(),
            deps.bus.clone(),
            logger,
            deps.config.clone(),
            deps.cancel.clone(),
        );
        let (returned, status) = monitor.run().await;
        agent = returned;

        if status != AgentStatus::Failed || agent.retry_count >= max_retries {
            return (agent, status);
        }

        // Failed with retries remaining: back off and relaunch.
        agent.retry_count += 1;
        agent.status = AgentStatus::Retrying;
        persist(&deps.store, &agent);

        let backoff = agent.task.retry.backoff_seconds(agent.retry_count);
        info!(
            agent = %agent.id,
            attempt = agent.retry_count,
            max = max_retries,
            backoff = backoff,
            "agent failed, retrying"
        );
        let agent_retry_payload = json!({
            "attempt": agent.retry_count,
            "max_retries": max_retries,
            "backoff_seconds": backoff,
        });
        publish_event(
            &deps.store,
            &deps.bus,
            &mut agent,
            "agent_retry",
            agent_retry_payload,
        );

        tokio::select! {
            _ = deps.cancel.cancelled() => {
                agent.status = AgentStatus::Killed;
                agent.completed_at = Some(chrono::Utc::now());
                agent.exit_reason = Some("Monitor cancelled".to_string());
                persist(&deps.store, &agent);
                return (agent, AgentStatus::Killed);
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(backoff)) => {}
        }

        let Some(session_name) = agent.tmux_session.clone() else {
            // Cannot relaunch without a session name.
            return (agent, status);
        };

        // Defensive: the failed session may still be lingering.
        deps.transport.kill_session(&session_name).await;

        let argv = deps.adapter.launch_argv(&agent.task, context);
        let created = deps
            .transport
            .create_session(&session_name, &argv, &context.path)
            .await;
        if !created {
            agent.status = AgentStatus::Failed;
            agent.completed_at = Some(chrono::Utc::now());
            agent.exit_reason = Some(format!(
                "Failed to recreate TMUX session on retry {}",
                agent.retry_count
            ));
            persist(&deps.store, &agent);
            return (agent, AgentStatus::Failed);
        }

        if deps.adapter.needs_prompt_after_launch() {
            wait_and_send_prompt(
                deps.transport.as_ref(),
                deps.adapter.as_ref(),
                &session_name,
                &agent.task.prompt,
            )
            .await;
        }

        agent.status = AgentStatus::Running;
        agent.state = AgentState::Initializing;
        agent.completed_at = None;
        agent.exit_reason = None;
        persist(&deps.store, &agent);
    }
}

/// Wait for an interactive tool to become ready, answering any
/// pre-prompt trust dialogs, then type the task prompt.
///
/// Falls back to sending the prompt anyway when readiness is never
/// detected within the adapter's startup budget.
pub async fn wait_and_send_prompt(
    transport: &dyn Transport,
    adapter: &dyn ToolAdapter,
    session_name: &str,
    prompt: &str,
) {
    let max_wait = adapter.startup_wait_seconds();
    let mut elapsed = 0.0;
    let mut ready = false;

    while elapsed < max_wait {
        tokio::time::sleep(READY_POLL).await;
        elapsed += READY_POLL.as_secs_f64();

        let output = transport.capture_output(session_name, 100).await;
        if output.trim().is_empty() {
            continue;
        }

        // Trust and permission dialogs can appear before the tool is
        // ready for its first prompt.
        if let Some(action) = adapter.should_auto_confirm(&output) {
            info!(
                session = %session_name,
                response = %action.response,
                "pre-prompt auto-confirm"
            );
            transport
                .send_input(session_name, &action.response, action.send_enter)
                .await;
            tokio::time::sleep(CONFIRM_SETTLE).await;
            elapsed += CONFIRM_SETTLE.as_secs_f64();
            continue;
        }

        if adapter.is_ready_for_input(&output) {
            info!(session = %session_name, elapsed = elapsed, "tool ready for input");
            ready = true;
            break;
        }
    }

    if !ready {
        warn!(
            session = %session_name,
            elapsed = elapsed,
            "tool readiness not detected, sending prompt anyway"
        );
    }

    transport.send_input(session_name, prompt, true).await;
}

fn persist(store: &AgentStore, agent: &Agent) {
    if let Err(e) = store.save(agent) {
        warn!(agent = %agent.id, error = %e, "failed to persist agent");
    }
}

/// Record an event on the agent, in the store, and on the bus.
pub(crate) fn publish_event(
    store: &AgentStore,
    bus: &EventBus,
    agent: &mut Agent,
    event_type: &str,
    detail: serde_json::Value,
) {
    let event = AgentEvent::new(agent.id.clone(), event_type, detail);
    agent.add_event(event.clone());
    if let Err(e) = store.add_event(&event) {
        warn!(agent = %agent.id, event = %event_type, error = %e, "failed to persist event");
    }
    bus.publish(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Completion, MockToolAdapter};
    use crate::models::{MachineConfig, RetryPolicy, TaskDefinition};
    use crate::storage::Database;
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn make_context() -> Context {
        Context::new("ctx", "/tmp/test", MachineConfig::default()).unwrap()
    }

    fn make_agent(context: &Context, max_retries: u32) -> Agent {
        let task = TaskDefinition::new("codex", "do it")
            .unwrap()
            .with_retry(RetryPolicy::new(max_retries, 1.05, 1.05).unwrap());
        let mut agent = Agent::new(task, context);
        agent.status = AgentStatus::Running;
        agent.started_at = Some(chrono::Utc::now());
        agent.tmux_session = Some("cam-retry-test".to_string());
        agent
    }

    fn deps(
        transport: MockTransport,
        adapter: MockToolAdapter,
        dir: &tempfile::TempDir,
    ) -> MonitorDeps {
        let mut config = CamConfig::default();
        config.monitor.poll_interval = 0.01;
        config.monitor.idle_timeout = 0;
        config.monitor.health_check_interval = 0;
        config.monitor.probe_detection = false;
        config.general.auto_confirm = false;
        MonitorDeps {
            transport: Arc::new(transport),
            adapter: Arc::new(adapter),
            store: Arc::new(AgentStore::new(Arc::new(
                Database::open_in_memory().unwrap(),
            ))),
            bus: Arc::new(EventBus::new()),
            config,
            log_dir: dir.path().to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    /// Adapter failing twice then completing, with session re-creation:
    /// the full retry narrative.
    #[tokio::test]
    async fn test_fail_fail_complete() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context();

        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "tool output here\n".to_string());
        transport.expect_kill_session().return_const(true);
        let creates = Arc::new(AtomicU32::new(0));
        let creates_clone = creates.clone();
        transport.expect_create_session().returning(move |_, _, _| {
            creates_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        // Completion verdicts per monitor attempt: failed, failed,
        // completed. detect_completion fires once per stable tick, so
        // key the verdict off a per-attempt counter bumped on launch.
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();
        let mut adapter = MockToolAdapter::new();
        adapter.expect_launch_argv().returning(move |_, _| {
            attempt_clone.fetch_add(1, Ordering::SeqCst);
            vec!["codex".to_string()]
        });
        adapter.expect_needs_prompt_after_launch().return_const(false);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());
        let attempt_read = attempt.clone();
        adapter.expect_detect_completion().returning(move |_| {
            if attempt_read.load(Ordering::SeqCst) < 2 {
                Some(Completion::Failed)
            } else {
                Some(Completion::Completed)
            }
        });

        let deps = deps(transport, adapter, &dir);
        let agent = make_agent(&context, 2);
        let agent_id = agent.id.clone();

        let retries = Arc::new(Mutex::new(Vec::new()));
        let retries_clone = retries.clone();
        deps.bus.subscribe("agent_retry", move |e| {
            retries_clone.lock().unwrap().push(e.detail.clone());
        });

        let (agent, status) = run_with_retries(agent, &context, &deps).await;

        assert_eq!(status, AgentStatus::Completed);
        assert_eq!(agent.retry_count, 2);
        assert_eq!(agent.id, agent_id);
        // Two re-creations (the original launch happened before the loop).
        assert_eq!(creates.load(Ordering::SeqCst), 2);

        let retries = retries.lock().unwrap();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0]["attempt"], 1);
        assert_eq!(retries[1]["attempt"], 2);

        let stored = deps.store.get(&agent.id).unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Completed);
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn test_no_retries_returns_failed() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context();

        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "Error: boom\n".to_string());

        let mut adapter = MockToolAdapter::new();
        adapter.expect_needs_prompt_after_launch().return_const(false);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());
        adapter
            .expect_detect_completion()
            .returning(|_| Some(Completion::Failed));

        let deps = deps(transport, adapter, &dir);
        let agent = make_agent(&context, 0);

        let (agent, status) = run_with_retries(agent, &context, &deps).await;
        assert_eq!(status, AgentStatus::Failed);
        assert_eq!(agent.retry_count, 0);
    }

    #[tokio::test]
    async fn test_recreate_failure_finalizes_failed() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context();

        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "output\n".to_string());
        transport.expect_kill_session().return_const(true);
        transport.expect_create_session().return_const(false);

        let mut adapter = MockToolAdapter::new();
        adapter
            .expect_launch_argv()
            .returning(|_, _| vec!["codex".to_string()]);
        adapter.expect_needs_prompt_after_launch().return_const(false);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());
        adapter
            .expect_detect_completion()
            .returning(|_| Some(Completion::Failed));

        let deps = deps(transport, adapter, &dir);
        let agent = make_agent(&context, 3);

        let (agent, status) = run_with_retries(agent, &context, &deps).await;
        assert_eq!(status, AgentStatus::Failed);
        assert_eq!(agent.retry_count, 1);
        assert!(agent
            .exit_reason
            .as_deref()
            .unwrap()
            .starts_with("Failed to recreate TMUX session"));
    }

    /// Timeouts do not re-enter the retry loop.
    #[tokio::test]
    async fn test_timeout_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context();

        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "never changes\n".to_string());
        transport.expect_kill_session().return_const(true);

        let mut adapter = MockToolAdapter::new();
        adapter.expect_needs_prompt_after_launch().return_const(false);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_detect_completion().returning(|_| None);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());

        let mut deps = deps(transport, adapter, &dir);
        deps.config.monitor.idle_timeout = 1;
        deps.config.monitor.poll_interval = 0.05;
        let agent = make_agent(&context, 5);

        let (agent, status) = run_with_retries(agent, &context, &deps).await;
        assert_eq!(status, AgentStatus::Timeout);
        assert_eq!(agent.retry_count, 0);
    }

    #[tokio::test]
    async fn test_prompt_resent_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context();

        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "ready> \n".to_string());
        transport.expect_kill_session().return_const(true);
        transport.expect_create_session().return_const(true);
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let prompts_clone = prompts.clone();
        transport
            .expect_send_input()
            .returning(move |_, text, enter| {
                prompts_clone.lock().unwrap().push((text.to_string(), enter));
                true
            });

        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();
        let mut adapter = MockToolAdapter::new();
        adapter.expect_launch_argv().returning(move |_, _| {
            attempt_clone.fetch_add(1, Ordering::SeqCst);
            vec!["claude".to_string()]
        });
        adapter.expect_needs_prompt_after_launch().return_const(true);
        adapter.expect_startup_wait_seconds().return_const(2.0);
        adapter.expect_is_ready_for_input().returning(|_| true);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());
        let attempt_read = attempt.clone();
        adapter.expect_detect_completion().returning(move |_| {
            if attempt_read.load(Ordering::SeqCst) == 0 {
                Some(Completion::Failed)
            } else {
                Some(Completion::Completed)
            }
        });

        let deps = deps(transport, adapter, &dir);
        let agent = make_agent(&context, 1);

        let (_, status) = run_with_retries(agent, &context, &deps).await;
        assert_eq!(status, AgentStatus::Completed);

        let prompts = prompts.lock().unwrap();
        assert!(prompts.contains(&("do it".to_string(), true)));
    }
}
