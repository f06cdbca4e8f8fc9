//! Structured JSON-lines logging for agent activity.
//!
//! Each agent gets one append-only `<log_dir>/<agent_id>.jsonl` file.
//! Entries record lifecycle events, raw output snapshots and probe
//! results so a finished run can be reconstructed offline.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in an agent's JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// ISO 8601 timestamp with timezone.
    pub ts: String,
    pub agent_id: String,
    /// Event type, e.g. "monitor_start", "output", "probe", "finalize".
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Writes structured JSONL logs for a single agent.
pub struct AgentLogger {
    agent_id: String,
    log_path: PathBuf,
    file: Option<File>,
}

impl AgentLogger {
    /// Create a logger for an agent. The log directory is created on open.
    pub fn new(agent_id: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        let agent_id = agent_id.into();
        let log_dir = log_dir.into();
        let log_path = log_dir.join(format!("{}.jsonl", agent_id));
        Self {
            agent_id,
            log_path,
            file: None,
        }
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Open the log file for appending.
    pub fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_path)?,
            );
        }
        Ok(())
    }

    /// Close the log file.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Append an entry. Errors are swallowed: logging must never take the
    /// monitor down.
    pub fn write(&mut self, event_type: &str, data: Option<Value>, output: Option<String>) {
        let entry = LogEntry {
            ts: Utc::now().to_rfc3339(),
            agent_id: self.agent_id.clone(),
            event_type: event_type.to_string(),
            data,
            output,
        };
        if let Some(file) = self.file.as_mut() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Read entries back, optionally only the trailing `tail` lines.
    /// Malformed lines are skipped.
    pub fn read_lines(&self, tail: Option<usize>) -> Vec<LogEntry> {
        let Ok(file) = File::open(&self.log_path) else {
            return Vec::new();
        };
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .collect();
        let lines = match tail {
            Some(n) if lines.len() > n => &lines[lines.len() - n..],
            _ => &lines[..],
        };
        lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Start following the log from its current end, like `tail -f`.
    pub fn follow(&self, poll_interval: Duration) -> std::io::Result<LogFollower> {
        if !self.log_path.exists() {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            File::create(&self.log_path)?;
        }
        let mut file = File::open(&self.log_path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(LogFollower {
            reader: BufReader::new(file),
            poll_interval,
        })
    }
}

/// Incremental reader over a growing JSONL log.
pub struct LogFollower {
    reader: BufReader<File>,
    poll_interval: Duration,
}

impl LogFollower {
    /// Wait for and return the next entry. Malformed lines are skipped.
    pub async fn next(&mut self) -> std::io::Result<LogEntry> {
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str(trimmed) {
                return Ok(entry);
            }
        }
    }
}
