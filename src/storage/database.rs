//! SQLite database management with auto-creation and migrations.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use super::StorageError;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Owns the SQLite connection and applies schema migrations.
///
/// The connection runs in WAL mode with autocommit so the API layer can
/// read concurrently while a monitor writes; SQLite's own locking
/// provides single-writer semantics. The `Mutex` serializes statement
/// execution within this process.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path` and migrate it
    /// to the current schema version.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the locked connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StorageError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        f(&conn).map_err(StorageError::from)
    }

    /// Apply migrations forward from `MAX(version)` in a single linear
    /// chain.
    fn migrate(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
            )?;

            let current: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?;

            if current < 1 {
                migrate_to_v1(conn)?;
            }
            Ok(())
        })
    }

    /// Schema version currently recorded in the database.
    pub fn schema_version(&self) -> Result<i64, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
        })
    }
}

fn migrate_to_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS contexts (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            path TEXT NOT NULL,
            machine_config TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            task_json TEXT NOT NULL,
            context_id TEXT NOT NULL,
            context_name TEXT NOT NULL,
            context_path TEXT NOT NULL,
            transport_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            state TEXT NOT NULL DEFAULT 'initializing',
            tmux_session TEXT,
            tmux_socket TEXT,
            pid INTEGER,
            started_at TEXT,
            completed_at TEXT,
            exit_reason TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            cost_estimate REAL,
            files_changed TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS agent_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT NOT NULL,
            timestamp TEXT NOT NULL DEFAULT (datetime('now')),
            event_type TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
        CREATE INDEX IF NOT EXISTS idx_agents_context_id ON agents(context_id);
        CREATE INDEX IF NOT EXISTS idx_agent_events_agent_id ON agent_events(agent_id);

        INSERT INTO schema_version (version) VALUES (1);",
    )
}
