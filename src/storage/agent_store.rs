//! Agent and agent-event persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, StorageError};
use crate::models::{Agent, AgentEvent, AgentState, AgentStatus, TaskDefinition, TransportType};

/// Filters for [`AgentStore::list`].
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub context_id: Option<String>,
    pub tool: Option<String>,
    pub limit: Option<u32>,
}

/// Manages storage and retrieval of agents and their events.
pub struct AgentStore {
    db: Arc<Database>,
}

impl AgentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update an agent.
    pub fn save(&self, agent: &Agent) -> Result<(), StorageError> {
        let task_json = serde_json::to_string(&agent.task)?;
        let files_json = serde_json::to_string(&agent.files_changed)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (
                    id, task_json, context_id, context_name, context_path,
                    transport_type, status, state, tmux_session, tmux_socket,
                    pid, started_at, completed_at, exit_reason, retry_count,
                    cost_estimate, files_changed, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                ON CONFLICT(id) DO UPDATE SET
                    task_json = excluded.task_json,
                    context_id = excluded.context_id,
                    context_name = excluded.context_name,
                    context_path = excluded.context_path,
                    transport_type = excluded.transport_type,
                    status = excluded.status,
                    state = excluded.state,
                    tmux_session = excluded.tmux_session,
                    tmux_socket = excluded.tmux_socket,
                    pid = excluded.pid,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    exit_reason = excluded.exit_reason,
                    retry_count = excluded.retry_count,
                    cost_estimate = excluded.cost_estimate,
                    files_changed = excluded.files_changed",
                params![
                    agent.id,
                    task_json,
                    agent.context_id,
                    agent.context_name,
                    agent.context_path,
                    agent.transport_type.as_str(),
                    agent.status.as_str(),
                    agent.state.as_str(),
                    agent.tmux_session,
                    agent.tmux_socket,
                    agent.pid,
                    agent.started_at.map(|t| t.to_rfc3339()),
                    agent.completed_at.map(|t| t.to_rfc3339()),
                    agent.exit_reason,
                    agent.retry_count,
                    agent.cost_estimate,
                    files_json,
                    agent
                        .started_at
                        .unwrap_or_else(Utc::now)
                        .to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get an agent by full id or unique prefix.
    ///
    /// The exact match is the fast path; a prefix falls back to a LIKE
    /// scan returning the most recently created match.
    pub fn get(&self, agent_id: &str) -> Result<Option<Agent>, StorageError> {
        let exact = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM agents WHERE id = ?1",
                [agent_id],
                row_to_agent,
            )
            .optional()
        })?;
        if exact.is_some() {
            return exact.transpose();
        }

        let prefix = format!("{}%", agent_id);
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM agents WHERE id LIKE ?1 ORDER BY created_at DESC LIMIT 1",
                [prefix],
                row_to_agent,
            )
            .optional()
        })?;
        row.transpose()
    }

    /// List agents, most recent first, honoring the filter.
    pub fn list(&self, filter: &AgentFilter) -> Result<Vec<Agent>, StorageError> {
        let mut query = String::from("SELECT * FROM agents WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if let Some(context_id) = &filter.context_id {
            query.push_str(" AND context_id = ?");
            params.push(Box::new(context_id.clone()));
        }
        if let Some(tool) = &filter.tool {
            query.push_str(" AND json_extract(task_json, '$.tool') = ?");
            params.push(Box::new(tool.clone()));
        }
        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Box::new(limit));
        }

        let results = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&query)?;
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), row_to_agent)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        results.into_iter().collect()
    }

    /// Update status and optionally state and exit reason. Terminal
    /// statuses stamp `completed_at`.
    pub fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        state: Option<AgentState>,
        exit_reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut query = String::from("UPDATE agents SET status = ?");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(status.as_str().to_string())];

        if let Some(state) = state {
            query.push_str(", state = ?");
            params.push(Box::new(state.as_str().to_string()));
        }
        if let Some(reason) = exit_reason {
            query.push_str(", exit_reason = ?");
            params.push(Box::new(reason.to_string()));
        }
        if status.is_terminal() {
            query.push_str(", completed_at = ?");
            params.push(Box::new(Utc::now().to_rfc3339()));
        }
        query.push_str(" WHERE id = ?");
        params.push(Box::new(agent_id.to_string()));

        let updated = self.db.with_conn(|conn| {
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            conn.execute(&query, refs.as_slice())
        })?;
        if updated == 0 {
            return Err(StorageError::NotFound(agent_id.to_string()));
        }
        Ok(())
    }

    /// Append an event.
    pub fn add_event(&self, event: &AgentEvent) -> Result<(), StorageError> {
        let detail = serde_json::to_string(&event.detail)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_events (agent_id, timestamp, event_type, detail)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.agent_id,
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    detail
                ],
            )?;
            Ok(())
        })
    }

    /// All events for an agent in insertion order (auto-increment key).
    pub fn get_events(&self, agent_id: &str) -> Result<Vec<AgentEvent>, StorageError> {
        let results = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, timestamp, event_type, detail
                 FROM agent_events WHERE agent_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([agent_id], row_to_event)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        results.into_iter().collect()
    }

    /// List `(id, tmux_session)` pairs matching prune-style filters.
    pub fn list_ids_by_filter(
        &self,
        statuses: Option<&[AgentStatus]>,
        before: Option<DateTime<Utc>>,
        context_id: Option<&str>,
    ) -> Result<Vec<(String, Option<String>)>, StorageError> {
        let mut query = String::from("SELECT id, tmux_session FROM agents WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(statuses) = statuses {
            if !statuses.is_empty() {
                let placeholders = vec!["?"; statuses.len()].join(",");
                query.push_str(&format!(" AND status IN ({})", placeholders));
                for status in statuses {
                    params.push(Box::new(status.as_str().to_string()));
                }
            }
        }
        if let Some(before) = before {
            query.push_str(" AND started_at < ?");
            params.push(Box::new(before.to_rfc3339()));
        }
        if let Some(context_id) = context_id {
            query.push_str(" AND context_id = ?");
            params.push(Box::new(context_id.to_string()));
        }

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&query)?;
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
    }

    /// Delete agents and their events in one batch. Returns the number
    /// of agents removed.
    pub fn delete_batch(&self, agent_ids: &[String]) -> Result<usize, StorageError> {
        if agent_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; agent_ids.len()].join(",");
        self.db.with_conn(|conn| {
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                agent_ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
            conn.execute(
                &format!("DELETE FROM agent_events WHERE agent_id IN ({})", placeholders),
                refs.as_slice(),
            )?;
            let deleted = conn.execute(
                &format!("DELETE FROM agents WHERE id IN ({})", placeholders),
                refs.as_slice(),
            )?;
            Ok(deleted)
        })
    }

    /// Delete one agent and its events.
    pub fn delete(&self, agent_id: &str) -> Result<bool, StorageError> {
        Ok(self.delete_batch(&[agent_id.to_string()])? > 0)
    }

    /// All agent ids in the database.
    pub fn all_ids(&self) -> Result<Vec<String>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM agents")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
        })
    }

    /// All session names recorded for any agent.
    pub fn all_session_names(&self) -> Result<Vec<String>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT tmux_session FROM agents WHERE tmux_session IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
        })
    }
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Result<Agent, StorageError>> {
    Ok(try_row_to_agent(row))
}

fn try_row_to_agent(row: &Row<'_>) -> Result<Agent, StorageError> {
    let task_json: String = row.get("task_json")?;
    let task: TaskDefinition = serde_json::from_str(&task_json)?;
    let files_json: String = row.get("files_changed")?;
    let files_changed: Vec<String> = serde_json::from_str(&files_json)?;

    let status_str: String = row.get("status")?;
    let status = AgentStatus::parse(&status_str)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown status '{}'", status_str)))?;
    let state_str: String = row.get("state")?;
    let state = AgentState::parse(&state_str)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown state '{}'", state_str)))?;
    let transport_str: String = row.get("transport_type")?;
    let transport_type = TransportType::parse(&transport_str).ok_or_else(|| {
        StorageError::Corrupt(format!("unknown transport '{}'", transport_str))
    })?;

    Ok(Agent {
        id: row.get("id")?,
        task,
        context_id: row.get("context_id")?,
        context_name: row.get("context_name")?,
        context_path: row.get("context_path")?,
        transport_type,
        status,
        state,
        tmux_session: row.get("tmux_session")?,
        tmux_socket: row.get("tmux_socket")?,
        pid: row.get("pid")?,
        started_at: parse_timestamp(row.get::<_, Option<String>>("started_at")?),
        completed_at: parse_timestamp(row.get::<_, Option<String>>("completed_at")?),
        exit_reason: row.get("exit_reason")?,
        retry_count: row.get("retry_count")?,
        events: Vec::new(),
        cost_estimate: row.get("cost_estimate")?,
        files_changed,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Result<AgentEvent, StorageError>> {
    let detail_json: String = row.get(3)?;
    let timestamp: String = row.get(1)?;
    Ok((|| {
        Ok(AgentEvent {
            agent_id: row.get(0)?,
            timestamp: parse_timestamp(Some(timestamp))
                .ok_or_else(|| StorageError::Corrupt("bad event timestamp".into()))?,
            event_type: row.get(2)?,
            detail: serde_json::from_str(&detail_json)?,
        })
    })())
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::models::{Context, MachineConfig};

    fn store() -> AgentStore {
        AgentStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn make_agent(tool: &str) -> Agent {
        let context =
            Context::new("test-ctx", "/tmp/test", MachineConfig::default()).unwrap();
        let mut agent = Agent::new(TaskDefinition::new(tool, "do something").unwrap(), &context);
        agent.started_at = Some(Utc::now());
        agent.tmux_session = Some(format!("cam-{}", &agent.id[..8]));
        agent
    }

    #[test]
    fn test_save_and_get_roundtrip() {
        let store = store();
        let agent = make_agent("claude");
        store.save(&agent).unwrap();

        let loaded = store.get(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.id, agent.id);
        assert_eq!(loaded.task.tool, "claude");
        assert_eq!(loaded.status, AgentStatus::Pending);
        assert_eq!(loaded.tmux_session, agent.tmux_session);
    }

    #[test]
    fn test_save_is_upsert() {
        let store = store();
        let mut agent = make_agent("claude");
        store.save(&agent).unwrap();
        agent.status = AgentStatus::Running;
        agent.retry_count = 2;
        store.save(&agent).unwrap();

        let loaded = store.get(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Running);
        assert_eq!(loaded.retry_count, 2);
    }

    #[test]
    fn test_get_by_prefix() {
        let store = store();
        let agent = make_agent("claude");
        store.save(&agent).unwrap();

        let loaded = store.get(&agent.id[..8]).unwrap().unwrap();
        assert_eq!(loaded.id, agent.id);
        assert!(store.get("ffffffff").unwrap().is_none());
    }

    #[test]
    fn test_list_filters_by_status_and_tool() {
        let store = store();
        let mut a = make_agent("claude");
        a.status = AgentStatus::Running;
        let b = make_agent("aider");
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let running = store
            .list(&AgentFilter {
                status: Some(AgentStatus::Running),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let aiders = store
            .list(&AgentFilter {
                tool: Some("aider".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(aiders.len(), 1);
        assert_eq!(aiders[0].id, b.id);
    }

    #[test]
    fn test_update_status_stamps_completed_at() {
        let store = store();
        let agent = make_agent("claude");
        store.save(&agent).unwrap();

        store
            .update_status(&agent.id, AgentStatus::Running, None, None)
            .unwrap();
        assert!(store.get(&agent.id).unwrap().unwrap().completed_at.is_none());

        store
            .update_status(
                &agent.id,
                AgentStatus::Completed,
                Some(AgentState::Idle),
                Some("done"),
            )
            .unwrap();
        let loaded = store.get(&agent.id).unwrap().unwrap();
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.state, AgentState::Idle);
        assert_eq!(loaded.exit_reason.as_deref(), Some("done"));
    }

    #[test]
    fn test_update_status_unknown_agent() {
        let store = store();
        let err = store
            .update_status("missing", AgentStatus::Failed, None, None)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_events_ordered_by_insertion() {
        let store = store();
        let agent = make_agent("claude");
        store.save(&agent).unwrap();

        for n in 0..5 {
            store
                .add_event(&AgentEvent::new(
                    agent.id.clone(),
                    "output",
                    json!({ "n": n }),
                ))
                .unwrap();
        }
        let events = store.get_events(&agent.id).unwrap();
        assert_eq!(events.len(), 5);
        let ns: Vec<i64> = events
            .iter()
            .map(|e| e.detail["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delete_batch_cascades_events() {
        let store = store();
        let a = make_agent("claude");
        let b = make_agent("claude");
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        store
            .add_event(&AgentEvent::new(a.id.clone(), "output", json!({})))
            .unwrap();

        let deleted = store
            .delete_batch(&[a.id.clone(), b.id.clone()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get(&a.id).unwrap().is_none());
        assert!(store.get_events(&a.id).unwrap().is_empty());
    }

    #[test]
    fn test_all_ids_and_session_names() {
        let store = store();
        let a = make_agent("claude");
        let mut b = make_agent("aider");
        b.tmux_session = None;
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let mut ids = store.all_ids().unwrap();
        ids.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        // Session names skip agents that never got a session.
        let sessions = store.all_session_names().unwrap();
        assert_eq!(sessions, vec![a.tmux_session.unwrap()]);
    }

    #[test]
    fn test_list_ids_by_filter() {
        let store = store();
        let mut a = make_agent("claude");
        a.status = AgentStatus::Killed;
        let mut b = make_agent("claude");
        b.status = AgentStatus::Running;
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let killed = store
            .list_ids_by_filter(Some(&[AgentStatus::Killed, AgentStatus::Timeout]), None, None)
            .unwrap();
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].0, a.id);

        let old = store
            .list_ids_by_filter(None, Some(Utc::now() + chrono::Duration::hours(1)), None)
            .unwrap();
        assert_eq!(old.len(), 2);
    }
}
