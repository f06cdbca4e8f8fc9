//! Context persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, StorageError};
use crate::models::{Context, MachineConfig, TransportType};

/// Manages storage and retrieval of contexts.
pub struct ContextStore {
    db: Arc<Database>,
}

impl ContextStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Add a new context. Names are unique.
    pub fn add(&self, context: &Context) -> Result<(), StorageError> {
        context.validate()?;
        let machine = serde_json::to_string(&context.machine)?;
        let tags = serde_json::to_string(&context.tags)?;
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contexts (id, name, path, machine_config, tags, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    context.id,
                    context.name,
                    context.path,
                    machine,
                    tags,
                    context.created_at.to_rfc3339(),
                    context.last_used_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        });
        match result {
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::AlreadyExists(context.name.clone()))
            }
            other => other,
        }
    }

    /// Get a context by id, falling back to name.
    pub fn get(&self, name_or_id: &str) -> Result<Option<Context>, StorageError> {
        let by_id = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM contexts WHERE id = ?1",
                [name_or_id],
                row_to_context,
            )
            .optional()
        })?;
        if by_id.is_some() {
            return by_id.transpose();
        }
        let by_name = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM contexts WHERE name = ?1",
                [name_or_id],
                row_to_context,
            )
            .optional()
        })?;
        by_name.transpose()
    }

    /// List contexts, most recent first, optionally filtered by tags
    /// (all must match) and transport type.
    pub fn list(
        &self,
        tags: Option<&[String]>,
        transport_type: Option<TransportType>,
    ) -> Result<Vec<Context>, StorageError> {
        let results = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM contexts ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], row_to_context)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        let mut contexts: Vec<Context> = results.into_iter().collect::<Result<_, _>>()?;

        if let Some(tags) = tags {
            contexts.retain(|c| tags.iter().all(|t| c.tags.contains(t)));
        }
        if let Some(transport) = transport_type {
            contexts.retain(|c| c.machine.transport_type() == transport);
        }
        Ok(contexts)
    }

    /// Replace a context's mutable fields after re-validation.
    pub fn update(&self, context: &Context) -> Result<(), StorageError> {
        context.validate()?;
        let machine = serde_json::to_string(&context.machine)?;
        let tags = serde_json::to_string(&context.tags)?;
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE contexts SET name = ?2, path = ?3, machine_config = ?4, tags = ?5
                 WHERE id = ?1",
                params![context.id, context.name, context.path, machine, tags],
            )
        })?;
        if updated == 0 {
            return Err(StorageError::NotFound(context.id.clone()));
        }
        Ok(())
    }

    /// Stamp last_used_at with the current time.
    pub fn update_last_used(&self, context_id: &str) -> Result<(), StorageError> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE contexts SET last_used_at = ?2 WHERE id = ?1",
                params![context_id, Utc::now().to_rfc3339()],
            )
        })?;
        if updated == 0 {
            return Err(StorageError::NotFound(context_id.to_string()));
        }
        Ok(())
    }

    /// Remove a context by id or name. The caller is responsible for
    /// checking no active agent references it; the store does not cascade.
    pub fn remove(&self, name_or_id: &str) -> Result<bool, StorageError> {
        let by_id = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM contexts WHERE id = ?1", [name_or_id])
        })?;
        if by_id > 0 {
            return Ok(true);
        }
        let by_name = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM contexts WHERE name = ?1", [name_or_id])
        })?;
        Ok(by_name > 0)
    }

    pub fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = self.db.with_conn(|conn| {
            conn.query_row("SELECT 1 FROM contexts WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()
        })?;
        Ok(found.is_some())
    }
}

fn row_to_context(row: &Row<'_>) -> rusqlite::Result<Result<Context, StorageError>> {
    let machine_json: String = row.get("machine_config")?;
    let tags_json: String = row.get("tags")?;
    let created_at: String = row.get("created_at")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    Ok((|| {
        let machine: MachineConfig = serde_json::from_str(&machine_json)?;
        let tags: Vec<String> = serde_json::from_str(&tags_json)?;
        Ok(Context {
            id: row.get("id")?,
            name: row.get("name")?,
            path: row.get("path")?,
            machine,
            tags,
            created_at: parse_timestamp(&created_at)
                .ok_or_else(|| StorageError::Corrupt("bad context timestamp".into()))?,
            last_used_at: last_used_at.as_deref().and_then(|s| parse_timestamp(s)),
        })
    })())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn make_context(name: &str) -> Context {
        Context::new(name, "/home/user/proj", MachineConfig::default())
            .unwrap()
            .with_tags(vec!["rust".into(), "web".into()])
    }

    #[test]
    fn test_add_get_roundtrip() {
        let store = store();
        let context = make_context("proj-a");
        store.add(&context).unwrap();

        let by_id = store.get(&context.id).unwrap().unwrap();
        assert_eq!(by_id, context);
        let by_name = store.get("proj-a").unwrap().unwrap();
        assert_eq!(by_name.id, context.id);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = store();
        store.add(&make_context("dup")).unwrap();
        let err = store.add(&make_context("dup")).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[test]
    fn test_list_filters() {
        let store = store();
        store.add(&make_context("a")).unwrap();
        let ssh = Context::new(
            "b",
            "/srv/proj",
            MachineConfig::Ssh {
                host: "h".into(),
                user: "u".into(),
                port: None,
                key_file: None,
                env_setup: None,
            },
        )
        .unwrap();
        store.add(&ssh).unwrap();

        let all = store.list(None, None).unwrap();
        assert_eq!(all.len(), 2);

        let tagged = store.list(Some(&["rust".to_string()]), None).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].name, "a");

        let remote = store.list(None, Some(TransportType::Ssh)).unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "b");
    }

    #[test]
    fn test_update_revalidates() {
        let store = store();
        let mut context = make_context("c");
        store.add(&context).unwrap();

        context.path = "relative".into();
        assert!(store.update(&context).is_err());

        context.path = "/other/place".into();
        store.update(&context).unwrap();
        assert_eq!(
            store.get("c").unwrap().unwrap().path,
            "/other/place"
        );
    }

    #[test]
    fn test_update_last_used() {
        let store = store();
        let context = make_context("d");
        store.add(&context).unwrap();
        assert!(store.get("d").unwrap().unwrap().last_used_at.is_none());
        store.update_last_used(&context.id).unwrap();
        assert!(store.get("d").unwrap().unwrap().last_used_at.is_some());
    }

    #[test]
    fn test_remove_by_name_or_id() {
        let store = store();
        let context = make_context("e");
        store.add(&context).unwrap();
        assert!(store.remove("e").unwrap());
        assert!(!store.remove("e").unwrap());
        assert!(!store.exists("e").unwrap());
    }
}
