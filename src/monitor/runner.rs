//! Detached monitor runner.
//!
//! When an agent is launched without `follow`, supervision must outlive
//! the launcher. A separate `cam-monitor <agent-id>` process re-hydrates
//! the agent from the store and runs the same monitor/retry loop as the
//! in-process path. The pid file is the coordination mechanism between
//! this process and `stop_agent`; everything else flows through the
//! shared database and the session itself.

use anyhow::{bail, Context as _};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapters::AdapterRegistry;
use crate::config::CamConfig;
use crate::models::AgentStatus;
use crate::monitor::retry::{run_with_retries, MonitorDeps};
use crate::paths::Paths;
use crate::storage::{AgentStore, ContextStore, Database};
use crate::transport::TransportFactory;

/// Write this process's pid so `stop_agent` can signal it.
pub fn write_pid_file(paths: &Paths, agent_id: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(paths.pid_dir())?;
    std::fs::write(paths.pid_path(agent_id), std::process::id().to_string())
}

/// Remove the pid file; missing files are fine.
pub fn remove_pid_file(paths: &Paths, agent_id: &str) {
    let path = paths.pid_path(agent_id);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Read a pid file if present.
pub fn read_pid_file(paths: &Paths, agent_id: &str) -> Option<u32> {
    std::fs::read_to_string(paths.pid_path(agent_id))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Supervise one agent to completion, self-contained.
///
/// Opens the store, loads the agent and its context, builds the
/// transport and adapter, and runs the retry loop. The pid file exists
/// for the duration of the run.
pub async fn run_detached(
    agent_id: &str,
    paths: &Paths,
    config: CamConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let db = std::sync::Arc::new(Database::open(&paths.db_path())?);
    let agent_store = std::sync::Arc::new(AgentStore::new(db.clone()));
    let context_store = ContextStore::new(db);

    let Some(agent) = agent_store.get(agent_id)? else {
        bail!("Agent {} not found in database", agent_id);
    };

    let mut registry = AdapterRegistry::new();
    registry.load_dir(&paths.adapter_dir());
    let Some(adapter) = registry.get(&agent.task.tool) else {
        let reason = format!("Unknown tool adapter: {}", agent.task.tool);
        fail_agent(&agent_store, agent_id, &reason);
        bail!(reason);
    };

    let Some(context) = context_store.get(&agent.context_id)? else {
        let reason = format!("Context not found: {}", agent.context_id);
        fail_agent(&agent_store, agent_id, &reason);
        bail!(reason);
    };

    let transport = TransportFactory::create(&context.machine, paths);

    write_pid_file(paths, agent_id).context("failed to write pid file")?;
    info!(agent = %agent_id, pid = std::process::id(), "detached monitor started");

    let deps = MonitorDeps {
        transport,
        adapter,
        store: agent_store.clone(),
        // Detached runners publish on their own in-process bus; the
        // launcher observes progress through the shared database.
        bus: std::sync::Arc::new(crate::events::EventBus::new()),
        config,
        log_dir: paths.log_dir(),
        cancel,
    };

    let result = run_with_retries(agent, &context, &deps).await;
    remove_pid_file(paths, agent_id);

    let (agent, status) = result;
    info!(agent = %agent.id, status = %status, "detached monitor finished");
    Ok(())
}

/// Mark an agent failed when the runner cannot even start supervising.
fn fail_agent(store: &AgentStore, agent_id: &str, reason: &str) {
    if let Ok(Some(mut agent)) = store.get(agent_id) {
        agent.status = AgentStatus::Failed;
        agent.completed_at = Some(Utc::now());
        agent.exit_reason = Some(reason.to_string());
        if let Err(e) = store.save(&agent) {
            error!(agent = %agent_id, error = %e, "failed to persist failure");
        }
    }
}
