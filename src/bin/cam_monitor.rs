//! Standalone monitor runner for detached agents.
//!
//! Spawned by the agent manager when an agent is launched without
//! `follow`; survives the launcher's exit and supervises the agent
//! through the same monitor/retry loop. SIGTERM (sent by `stop_agent`)
//! cleans up the pid file and exits.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cam::config::CamConfig;
use cam::monitor::runner::{remove_pid_file, run_detached};
use cam::paths::Paths;

#[derive(Parser)]
#[command(name = "cam-monitor", about = "Detached agent monitor for CAM")]
struct Args {
    /// ID of the agent to supervise.
    agent_id: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let paths = Paths::resolve();

    let config = match CamConfig::load(&paths, None) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cam-monitor: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone())),
        )
        .init();

    let cancel = CancellationToken::new();

    // SIGTERM from stop_agent: drop the pid file and leave; the manager
    // kills the session itself.
    {
        let paths = paths.clone();
        let agent_id = args.agent_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler installation");
            sigterm.recv().await;
            remove_pid_file(&paths, &agent_id);
            cancel.cancel();
            // Give the monitor one tick to finalize as killed.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            std::process::exit(0);
        });
    }

    if let Err(e) = run_detached(&args.agent_id, &paths, config, cancel).await {
        error!(agent = %args.agent_id, error = %e, "monitor runner failed");
        remove_pid_file(&paths, &args.agent_id);
        std::process::exit(1);
    }
}
