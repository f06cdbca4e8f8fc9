//! Install layout for CAM state on disk.
//!
//! Everything lives under a single data root (XDG-style by default,
//! overridable with `CAM_DATA_DIR`). Directories are created lazily by
//! the components that write into them.

use std::path::PathBuf;

/// Resolved filesystem layout for one CAM install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Root data directory (`~/.local/share/cam` by default).
    pub data_dir: PathBuf,
    /// Config directory (`~/.config/cam` by default).
    pub config_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from the environment, falling back to XDG defaults.
    pub fn resolve() -> Self {
        let data_dir = std::env::var_os("CAM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local/share/cam")
            });
        let config_dir = std::env::var_os("CAM_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config/cam")
            });
        Self {
            data_dir,
            config_dir,
        }
    }

    /// Build a layout rooted at an explicit data directory (used by tests).
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let config_dir = data_dir.join("config");
        Self {
            data_dir,
            config_dir,
        }
    }

    /// Path to the embedded database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cam.db")
    }

    /// Per-agent JSON-lines logs.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Per-session tmux sockets.
    pub fn socket_dir(&self) -> PathBuf {
        self.data_dir.join("sockets")
    }

    /// Per-agent pid files for detached runners.
    pub fn pid_dir(&self) -> PathBuf {
        self.data_dir.join("pids")
    }

    /// Declarative adapter definitions (`*.toml`).
    pub fn adapter_dir(&self) -> PathBuf {
        self.data_dir.join("adapters")
    }

    /// Raw pipe-pane output logs for screen reconstruction.
    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    /// Global config file.
    pub fn global_config(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Socket file for a session.
    pub fn socket_path(&self, session: &str) -> PathBuf {
        self.socket_dir().join(format!("{}.sock", session))
    }

    /// Pid file for a detached runner.
    pub fn pid_path(&self, agent_id: &str) -> PathBuf {
        self.pid_dir().join(format!("{}.pid", agent_id))
    }
}

/// Project-scoped config file, searched upward from the working directory.
pub const PROJECT_CONFIG: &str = ".cam/config.toml";

/// Remote hosts keep their sockets in a fixed location.
pub const REMOTE_SOCKET_DIR: &str = "/tmp/cam-sockets";

/// Remote hosts keep pipe-pane logs here.
pub const REMOTE_LOG_DIR: &str = "/tmp/cam-logs";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let paths = Paths::rooted_at("/tmp/cam-test");
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/cam-test/cam.db"));
        assert_eq!(
            paths.socket_path("cam-abc123"),
            PathBuf::from("/tmp/cam-test/sockets/cam-abc123.sock")
        );
        assert_eq!(
            paths.pid_path("agent-1"),
            PathBuf::from("/tmp/cam-test/pids/agent-1.pid")
        );
    }
}
