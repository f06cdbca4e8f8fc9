//! Central orchestrator for agent lifecycle: launch, monitor handoff,
//! stop, reconciliation, and pruning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::config::CamConfig;
use crate::events::EventBus;
use crate::models::{Agent, AgentStatus, Context, MachineConfig, TaskDefinition};
use crate::monitor::retry::{publish_event, run_with_retries, wait_and_send_prompt, MonitorDeps};
use crate::monitor::runner::{read_pid_file, remove_pid_file};
use crate::paths::Paths;
use crate::storage::{AgentFilter, AgentStore, ContextStore, Database, StorageError};
use crate::transport::{Transport, TransportFactory};
use crate::utils::terminal::{render_raw_log, render_raw_stream};

/// Upper bound on one incremental raw-log fetch from a remote transport.
const MAX_RAW_READ: u64 = 256_000;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("No adapter registered for tool '{tool}'. Available adapters: {available}")]
    UnknownTool { tool: String, available: String },
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),
    #[error("Failed to create TMUX session")]
    SessionCreateFailed,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

type TransportFactoryFn =
    Box<dyn Fn(&MachineConfig, &Paths) -> Arc<dyn Transport> + Send + Sync>;

/// Coordinates agents across transports, adapters, storage, and the
/// event bus.
pub struct AgentManager {
    config: CamConfig,
    paths: Paths,
    agent_store: Arc<AgentStore>,
    context_store: Arc<ContextStore>,
    bus: Arc<EventBus>,
    registry: AdapterRegistry,
    transport_factory: TransportFactoryFn,
    /// Transports are reused per machine config; sockets and control
    /// masters stay warm across agents on the same machine.
    transports: DashMap<String, Arc<dyn Transport>>,
    /// Cancellation handles for monitors running in this process. An
    /// agent is owned either here or by a detached runner's pid file,
    /// never both.
    monitors: DashMap<String, CancellationToken>,
}

impl AgentManager {
    pub fn new(config: CamConfig, paths: Paths, db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        let mut registry = AdapterRegistry::new();
        registry.load_dir(&paths.adapter_dir());
        Self {
            config,
            paths,
            agent_store: Arc::new(AgentStore::new(db.clone())),
            context_store: Arc::new(ContextStore::new(db)),
            bus,
            registry,
            transport_factory: Box::new(|machine, paths| TransportFactory::create(machine, paths)),
            transports: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    /// Replace the adapter registry (tests, embedders).
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace transport construction (tests).
    pub fn with_transport_factory(mut self, factory: TransportFactoryFn) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn agent_store(&self) -> &Arc<AgentStore> {
        &self.agent_store
    }

    pub fn context_store(&self) -> &Arc<ContextStore> {
        &self.context_store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Create, start, and optionally monitor an agent.
    ///
    /// With `follow` the call blocks until the agent is terminal; without
    /// it, a detached runner process takes ownership and the agent is
    /// returned in `running`.
    pub async fn run_agent(
        &self,
        task: TaskDefinition,
        context: &Context,
        follow: bool,
    ) -> Result<Agent, ManagerError> {
        let Some(adapter) = self.registry.get(&task.tool) else {
            let available = self.registry.names().join(", ");
            return Err(ManagerError::UnknownTool {
                tool: task.tool.clone(),
                available: if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available
                },
            });
        };

        let transport = self.transport_for(&context.machine);

        let mut agent = Agent::new(task, context);
        let session_name = format!("cam-{}", &agent.id.replace('-', "")[..12]);
        agent.tmux_session = Some(session_name.clone());
        agent.tmux_socket = Some(
            self.paths
                .socket_path(&session_name)
                .to_string_lossy()
                .into_owned(),
        );
        agent.status = AgentStatus::Starting;
        agent.started_at = Some(Utc::now());
        self.agent_store.save(&agent)?;
        info!(
            agent = %agent.id,
            task = agent.task.name.as_deref().unwrap_or("-"),
            context = %context.name,
            "created agent"
        );

        let argv = adapter.launch_argv(&agent.task, context);
        let created = transport
            .create_session(&session_name, &argv, &context.path)
            .await;
        if !created {
            agent.status = AgentStatus::Failed;
            agent.completed_at = Some(Utc::now());
            agent.exit_reason = Some("Failed to create TMUX session".to_string());
            self.agent_store.save(&agent)?;
            return Err(ManagerError::SessionCreateFailed);
        }

        // Pipe the raw pane stream to disk for offline screen
        // reconstruction. Best-effort: not every transport supports it.
        let raw_log = self.raw_log_path(&session_name);
        if let Err(e) = std::fs::create_dir_all(self.paths.raw_dir()) {
            debug!(error = %e, "could not create raw log dir");
        } else if !transport
            .start_logging(&session_name, &raw_log.to_string_lossy())
            .await
        {
            debug!(session = %session_name, "raw output logging unavailable");
        }

        if adapter.needs_prompt_after_launch() {
            wait_and_send_prompt(
                transport.as_ref(),
                adapter.as_ref(),
                &session_name,
                &agent.task.prompt,
            )
            .await;
        }

        agent.status = AgentStatus::Running;
        self.agent_store
            .update_status(&agent.id, AgentStatus::Running, None, None)?;
        if let Err(e) = self.context_store.update_last_used(&context.id) {
            debug!(context = %context.id, error = %e, "failed to update last_used_at");
        }

        let agent_started_payload = json!({
            "task": agent.task.name,
            "tool": agent.task.tool,
            "context": context.name,
        });
        publish_event(
            &self.agent_store,
            &self.bus,
            &mut agent,
            "agent_started",
            agent_started_payload,
        );

        if follow {
            let cancel = CancellationToken::new();
            self.monitors.insert(agent.id.clone(), cancel.clone());
            let deps = MonitorDeps {
                transport,
                adapter,
                store: self.agent_store.clone(),
                bus: self.bus.clone(),
                config: self.config.clone(),
                log_dir: self.paths.log_dir(),
                cancel,
            };
            let (agent, _status) = run_with_retries(agent, context, &deps).await;
            self.monitors.remove(&agent.id);
            Ok(agent)
        } else {
            self.spawn_detached_runner(&agent.id);
            Ok(agent)
        }
    }

    /// Stop a running agent. Terminal agents are left untouched.
    pub async fn stop_agent(&self, agent_id: &str, graceful: bool) -> Result<(), ManagerError> {
        let Some(mut agent) = self.agent_store.get(agent_id)? else {
            return Err(ManagerError::AgentNotFound(agent_id.to_string()));
        };

        if agent.is_terminal() {
            info!(agent = %agent.id, status = %agent.status, "agent already terminal");
            return Ok(());
        }

        // In-process owner: cancel its monitor.
        if let Some((_, cancel)) = self.monitors.remove(&agent.id) {
            cancel.cancel();
        }

        // Detached owner: signal the runner; it removes its pid file.
        if let Some(pid) = read_pid_file(&self.paths, &agent.id) {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => info!(agent = %agent.id, pid, "signalled detached monitor"),
                    Err(e) => debug!(agent = %agent.id, pid, error = %e, "monitor signal failed"),
                }
            }
            remove_pid_file(&self.paths, &agent.id);
        }

        // The session itself.
        if let Some(session) = agent.tmux_session.clone() {
            if let Some(context) = self.context_store.get(&agent.context_id)? {
                let transport = self.transport_for(&context.machine);
                if !transport.kill_session(&session).await {
                    warn!(agent = %agent.id, session = %session, "failed to kill session");
                }
            }
        }

        let reason = if graceful { "Stopped by user" } else { "Force killed" };
        self.agent_store
            .update_status(&agent.id, AgentStatus::Killed, None, Some(reason))?;

        publish_event(
            &self.agent_store,
            &self.bus,
            &mut agent,
            "agent_killed",
            json!({"graceful": graceful}),
        );
        info!(agent = %agent.id, graceful, "stopped agent");
        Ok(())
    }

    /// Cross-check every `running` agent against live sessions; agents
    /// whose sessions vanished are marked failed.
    pub async fn reconcile(&self) -> Result<Vec<Agent>, ManagerError> {
        let mut orphaned = Vec::new();
        let running = self.agent_store.list(&AgentFilter {
            status: Some(AgentStatus::Running),
            ..Default::default()
        })?;

        for mut agent in running {
            let Some(session) = agent.tmux_session.clone() else {
                self.agent_store.update_status(
                    &agent.id,
                    AgentStatus::Failed,
                    None,
                    Some("No TMUX session ID recorded"),
                )?;
                orphaned.push(agent);
                continue;
            };

            let Some(context) = self.context_store.get(&agent.context_id)? else {
                self.agent_store.update_status(
                    &agent.id,
                    AgentStatus::Failed,
                    None,
                    Some("Context no longer exists"),
                )?;
                orphaned.push(agent);
                continue;
            };

            let transport = self.transport_for(&context.machine);
            if !transport.session_exists(&session).await {
                self.agent_store.update_status(
                    &agent.id,
                    AgentStatus::Failed,
                    None,
                    Some("TMUX session disappeared"),
                )?;
                publish_event(
                    &self.agent_store,
                    &self.bus,
                    &mut agent,
                    "agent_orphaned",
                    json!({"session": session}),
                );
                warn!(agent = %agent.id, session = %session, "agent orphaned");
                orphaned.push(agent);
            }
        }

        if !orphaned.is_empty() {
            info!(count = orphaned.len(), "reconciliation found orphaned agents");
        }
        Ok(orphaned)
    }

    /// Delete finished agents (and their events), killing any sessions
    /// still lingering. Returns the number of agents removed.
    pub async fn prune(
        &self,
        statuses: Option<&[AgentStatus]>,
        before: Option<DateTime<Utc>>,
        context_id: Option<&str>,
    ) -> Result<usize, ManagerError> {
        let candidates = self
            .agent_store
            .list_ids_by_filter(statuses, before, context_id)?;
        if candidates.is_empty() {
            return Ok(0);
        }

        for (agent_id, session) in &candidates {
            let Some(session) = session else { continue };
            let Ok(Some(agent)) = self.agent_store.get(agent_id) else {
                continue;
            };
            if let Ok(Some(context)) = self.context_store.get(&agent.context_id) {
                let transport = self.transport_for(&context.machine);
                if transport.session_exists(session).await {
                    transport.kill_session(session).await;
                }
            }
        }

        let ids: Vec<String> = candidates.into_iter().map(|(id, _)| id).collect();
        let deleted = self.agent_store.delete_batch(&ids)?;
        info!(deleted, "pruned agents");
        Ok(deleted)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, ManagerError> {
        Ok(self.agent_store.get(agent_id)?)
    }

    pub fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>, ManagerError> {
        Ok(self.agent_store.list(filter)?)
    }

    /// Reconstructed terminal output for an agent, rendered from the
    /// raw pipe-pane stream with scrollback intact. Local sessions read
    /// the log file directly; remote ones fetch it through the
    /// transport's incremental log read.
    pub async fn raw_output(
        &self,
        agent: &Agent,
        tail: Option<usize>,
    ) -> Result<String, ManagerError> {
        let Some(session) = &agent.tmux_session else {
            return Ok(String::new());
        };

        let local = self.raw_log_path(session);
        if local.exists() {
            return Ok(render_raw_log(&local, tail));
        }

        let Some(context) = self.context_store.get(&agent.context_id)? else {
            return Ok(String::new());
        };
        let transport = self.transport_for(&context.machine);
        let (raw, _) = transport.read_output_log(session, 0, MAX_RAW_READ).await;
        Ok(render_raw_stream(&raw, tail))
    }

    fn raw_log_path(&self, session: &str) -> std::path::PathBuf {
        self.paths.raw_dir().join(format!("{}.output.log", session))
    }

    /// Attach command for an agent's session on the right transport.
    pub fn attach_command(&self, agent: &Agent) -> Result<Option<String>, ManagerError> {
        let Some(session) = &agent.tmux_session else {
            return Ok(None);
        };
        let Some(context) = self.context_store.get(&agent.context_id)? else {
            return Ok(None);
        };
        let transport = self.transport_for(&context.machine);
        Ok(Some(transport.attach_command(session)))
    }

    fn transport_for(&self, machine: &MachineConfig) -> Arc<dyn Transport> {
        let key = serde_json::to_string(machine).unwrap_or_default();
        if let Some(existing) = self.transports.get(&key) {
            return existing.clone();
        }
        let transport = (self.transport_factory)(machine, &self.paths);
        self.transports.insert(key, transport.clone());
        transport
    }

    /// Launch the detached runner for an agent. The child becomes a
    /// session leader with stdio on /dev/null so it survives our exit.
    fn spawn_detached_runner(&self, agent_id: &str) {
        let binary = monitor_binary();
        let mut command = std::process::Command::new(&binary);
        command
            .arg(agent_id)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from the controlling terminal.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }

        match command.spawn() {
            Ok(child) => {
                info!(agent = %agent_id, pid = child.id(), binary = %binary, "spawned detached monitor");
            }
            Err(e) => {
                warn!(agent = %agent_id, binary = %binary, error = %e, "failed to spawn detached monitor");
            }
        }
    }
}

/// Locate the `cam-monitor` binary: explicit override, then a sibling of
/// the current executable, then PATH.
fn monitor_binary() -> String {
    if let Ok(explicit) = std::env::var("CAM_MONITOR_BIN") {
        return explicit;
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("cam-monitor");
            if sibling.exists() {
                return sibling.to_string_lossy().into_owned();
            }
        }
    }
    "cam-monitor".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Completion, MockToolAdapter, ToolAdapter};
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn fast_config() -> CamConfig {
        let mut config = CamConfig::default();
        config.monitor.poll_interval = 0.01;
        config.monitor.idle_timeout = 0;
        config.monitor.health_check_interval = 0;
        config.monitor.probe_detection = false;
        config.general.auto_confirm = false;
        config
    }

    struct Setup {
        manager: AgentManager,
        context: Context,
        _dir: tempfile::TempDir,
    }

    fn stub_adapter_for(tool: &str, completion: Option<Completion>) -> MockToolAdapter {
        let tool = tool.to_string();
        let mut adapter = MockToolAdapter::new();
        adapter.expect_name().return_const(tool.clone());
        adapter.expect_display_name().return_const(tool);
        adapter
            .expect_launch_argv()
            .returning(|task, _| vec![task.tool.clone()]);
        adapter.expect_needs_prompt_after_launch().return_const(false);
        adapter.expect_detect_state().returning(|_| None);
        adapter.expect_should_auto_confirm().returning(|_| None);
        adapter.expect_detect_completion().returning(move |_| completion);
        adapter.expect_estimate_cost().returning(|_| None);
        adapter.expect_parse_files_changed().returning(|_| Vec::new());
        adapter
    }

    fn setup(transport: MockTransport, adapter: MockToolAdapter) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(dir.path());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());

        let mut registry = AdapterRegistry::new();
        registry.unregister(adapter.name());
        registry.register(Arc::new(adapter)).unwrap();

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let manager = AgentManager::new(fast_config(), paths, db, bus)
            .with_registry(registry)
            .with_transport_factory(Box::new(move |_, _| transport.clone()));

        let context = Context::new("test-ctx", "/tmp/test", MachineConfig::default()).unwrap();
        manager.context_store().add(&context).unwrap();
        Setup {
            manager,
            context,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected_before_any_session() {
        let transport = MockTransport::new(); // create_session would panic
        let s = setup(transport, stub_adapter_for("claude", None));
        let task = TaskDefinition::new("no-such-tool", "p").unwrap();
        let err = s.manager.run_agent(task, &s.context, true).await.unwrap_err();
        match err {
            ManagerError::UnknownTool { tool, available } => {
                assert_eq!(tool, "no-such-tool");
                assert!(available.contains("claude"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_session_create_failure_finalizes_failed() {
        let mut transport = MockTransport::new();
        transport.expect_create_session().return_const(false);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let err = s.manager.run_agent(task, &s.context, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::SessionCreateFailed));

        let agents = s.manager.list_agents(&AgentFilter::default()).unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, AgentStatus::Failed);
        assert_eq!(
            agents[0].exit_reason.as_deref(),
            Some("Failed to create TMUX session")
        );
        assert!(agents[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_follow_runs_to_completion() {
        // Session exits after the first health check: S1 shape.
        let mut transport = MockTransport::new();
        transport.expect_create_session().return_const(true);
        // Raw logging is offered the session-specific log path.
        transport
            .expect_start_logging()
            .withf(|session, path| path.ends_with(&format!("{}.output.log", session)))
            .times(1)
            .return_const(true);
        let alive = AtomicBool::new(true);
        transport
            .expect_session_exists()
            .returning(move |_| alive.swap(false, Ordering::SeqCst));
        transport
            .expect_capture_output()
            .returning(|_, _| "Done\n".to_string());

        let s = setup(
            transport,
            stub_adapter_for("claude", Some(Completion::Completed)),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        s.manager.bus().subscribe("*", move |e| {
            events_clone.lock().unwrap().push(e.event_type.clone());
        });

        let task = TaskDefinition::new("claude", "echo Done").unwrap();
        let agent = s.manager.run_agent(task, &s.context, true).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.exit_reason.as_deref(), Some("Session ended cleanly"));
        assert!(agent
            .tmux_session
            .as_deref()
            .unwrap()
            .starts_with("cam-"));
        assert_eq!(agent.tmux_session.as_deref().unwrap().len(), 16);

        let seen = events.lock().unwrap();
        assert!(seen.contains(&"agent_started".to_string()));
        assert!(seen.contains(&"agent_finished".to_string()));

        // Context usage is stamped.
        let context = s.manager.context_store().get("test-ctx").unwrap().unwrap();
        assert!(context.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_agent_kills_and_marks() {
        let mut transport = MockTransport::new();
        transport.expect_create_session().return_const(true);
        // This backend has no raw logging; launch proceeds regardless.
        transport.expect_start_logging().return_const(false);
        transport.expect_session_exists().return_const(true);
        transport
            .expect_capture_output()
            .returning(|_, _| "working\n".to_string());
        let killed = Arc::new(AtomicBool::new(false));
        let killed_clone = killed.clone();
        transport.expect_kill_session().returning(move |_| {
            killed_clone.store(true, Ordering::SeqCst);
            true
        });

        let s = setup(transport, stub_adapter_for("claude", None));

        // Launch detached-ish: skip the monitor entirely by launching
        // with follow=false; the runner spawn fails quietly (no binary)
        // which leaves the agent running and unowned.
        std::env::set_var("CAM_MONITOR_BIN", "/nonexistent/cam-monitor");
        let task = TaskDefinition::new("claude", "p").unwrap();
        let agent = s.manager.run_agent(task, &s.context, false).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Running);

        s.manager.stop_agent(&agent.id, true).await.unwrap();
        assert!(killed.load(Ordering::SeqCst));

        let stored = s.manager.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Killed);
        assert_eq!(stored.exit_reason.as_deref(), Some("Stopped by user"));

        // Stopping again is a no-op.
        s.manager.stop_agent(&agent.id, false).await.unwrap();
        let stored = s.manager.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(stored.exit_reason.as_deref(), Some("Stopped by user"));
    }

    #[tokio::test]
    async fn test_stop_unknown_agent() {
        let s = setup(MockTransport::new(), stub_adapter_for("claude", None));
        let err = s.manager.stop_agent("missing", true).await.unwrap_err();
        assert!(matches!(err, ManagerError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_reconcile_marks_orphans() {
        // An agent recorded as running with no session underneath.
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(false);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let mut agent = Agent::new(task, &s.context);
        agent.status = AgentStatus::Running;
        agent.started_at = Some(Utc::now());
        agent.tmux_session = Some("cam-ghost".to_string());
        s.manager.agent_store().save(&agent).unwrap();

        let orphan_events = Arc::new(Mutex::new(0usize));
        let orphan_clone = orphan_events.clone();
        s.manager.bus().subscribe("agent_orphaned", move |_| {
            *orphan_clone.lock().unwrap() += 1;
        });

        let orphaned = s.manager.reconcile().await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(*orphan_events.lock().unwrap(), 1);

        let stored = s.manager.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Failed);
        assert_eq!(
            stored.exit_reason.as_deref(),
            Some("TMUX session disappeared")
        );
    }

    #[tokio::test]
    async fn test_reconcile_ignores_healthy_agents() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let mut agent = Agent::new(task, &s.context);
        agent.status = AgentStatus::Running;
        agent.tmux_session = Some("cam-alive".to_string());
        s.manager.agent_store().save(&agent).unwrap();

        let orphaned = s.manager.reconcile().await.unwrap();
        assert!(orphaned.is_empty());
        assert_eq!(
            s.manager.get_agent(&agent.id).unwrap().unwrap().status,
            AgentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_prune_removes_finished_agents() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(false);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let mut done = Agent::new(task.clone(), &s.context);
        done.status = AgentStatus::Killed;
        done.started_at = Some(Utc::now());
        done.tmux_session = Some("cam-old".to_string());
        s.manager.agent_store().save(&done).unwrap();

        let mut running = Agent::new(task, &s.context);
        running.status = AgentStatus::Running;
        running.started_at = Some(Utc::now());
        s.manager.agent_store().save(&running).unwrap();

        let pruned = s
            .manager
            .prune(Some(&[AgentStatus::Killed, AgentStatus::Timeout]), None, None)
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(s.manager.get_agent(&done.id).unwrap().is_none());
        assert!(s.manager.get_agent(&running.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_raw_output_renders_local_log_with_scrollback() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let mut agent = Agent::new(task, &s.context);
        agent.tmux_session = Some("cam-rawtest".to_string());
        s.manager.agent_store().save(&agent).unwrap();

        // A raw pipe-pane stream longer than one screen: the early
        // lines must come back from scrollback.
        let paths = Paths::rooted_at(s._dir.path());
        std::fs::create_dir_all(paths.raw_dir()).unwrap();
        let raw: String = (1..=80).map(|n| format!("step {}\r\n", n)).collect();
        std::fs::write(paths.raw_dir().join("cam-rawtest.output.log"), raw).unwrap();

        let full = s.manager.raw_output(&agent, None).await.unwrap();
        assert!(full.starts_with("step 1\n"));
        assert!(full.ends_with("step 80"));

        let tailed = s.manager.raw_output(&agent, Some(2)).await.unwrap();
        assert_eq!(tailed, "step 79\nstep 80");
    }

    #[tokio::test]
    async fn test_raw_output_falls_back_to_transport_log() {
        let mut transport = MockTransport::new();
        transport
            .expect_read_output_log()
            .returning(|_, offset, _| ("remote line\r\n".to_string(), offset + 13));
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let mut agent = Agent::new(task, &s.context);
        agent.tmux_session = Some("cam-remote".to_string());
        s.manager.agent_store().save(&agent).unwrap();

        let out = s.manager.raw_output(&agent, None).await.unwrap();
        assert_eq!(out, "remote line");
    }

    #[tokio::test]
    async fn test_get_agent_by_prefix() {
        let mut transport = MockTransport::new();
        transport.expect_session_exists().return_const(true);
        let s = setup(transport, stub_adapter_for("claude", None));

        let task = TaskDefinition::new("claude", "p").unwrap();
        let agent = Agent::new(task, &s.context);
        s.manager.agent_store().save(&agent).unwrap();

        let found = s.manager.get_agent(&agent.id[..8]).unwrap().unwrap();
        assert_eq!(found.id, agent.id);
    }
}
