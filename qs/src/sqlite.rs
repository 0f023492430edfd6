//! SQLite-backed store
//!
//! One connection behind a mutex. The identity constraint lives in a partial
//! unique index so insert-if-absent is a single statement.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{BlobStore, InsertOutcome, TaskFilter, TaskStore};
use crate::task::{Task, TaskStatus, TaskUpdate, now_ms};

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

const TASK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    subject_id   TEXT NOT NULL,
    operation    TEXT NOT NULL,
    params       TEXT NOT NULL DEFAULT '{}',
    priority     INTEGER NOT NULL,
    retries      INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    status       TEXT NOT NULL,
    bulk_id      TEXT,
    created_at   INTEGER NOT NULL,
    started_at   INTEGER,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON tasks(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_bulk ON tasks(bulk_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_active_identity
    ON tasks(subject_id, operation) WHERE status IN ('pending', 'in_progress');
"#;

const BLOB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    namespace  TEXT NOT NULL,
    key        TEXT NOT NULL,
    data       BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);
"#;

const TASK_COLUMNS: &str =
    "id, subject_id, operation, params, priority, retries, last_error, status, bulk_id, created_at, started_at, completed_at";

/// SQLite task store
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
    blobs_ready: AtomicBool,
}

impl SqliteTaskStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteTaskStore::open: called");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened task store");
        Ok(store)
    }

    /// Create a private in-memory database
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(TASK_SCHEMA)?;
        if version < SCHEMA_VERSION {
            debug!(from = version, to = SCHEMA_VERSION, "SqliteTaskStore::init: setting schema version");
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            blobs_ready: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Create the blob table on first use
    fn blob_conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        let conn = self.lock()?;
        if !self.blobs_ready.load(Ordering::Acquire) {
            debug!("SqliteTaskStore: creating blob table");
            conn.execute_batch(BLOB_SCHEMA)?;
            self.blobs_ready.store(true, Ordering::Release);
        }
        Ok(conn)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let params_json: String = row.get("params")?;
        let params = serde_json::from_str(&params_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let status_str: String = row.get("status")?;
        let status = status_str.parse::<TaskStatus>().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                Type::Text,
                Box::new(StoreError::InvalidValue {
                    column: "status",
                    value: status_str.clone(),
                }),
            )
        })?;

        Ok(Task {
            id: row.get("id")?,
            subject_id: row.get("subject_id")?,
            operation: row.get("operation")?,
            params,
            priority: row.get("priority")?,
            retries: row.get("retries")?,
            last_error: row.get("last_error")?,
            status,
            bulk_id: row.get("bulk_id")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn add(&self, task: &Task) -> StoreResult<InsertOutcome> {
        debug!(id = %task.id, subject = %task.subject_id, operation = %task.operation, "SqliteTaskStore::add: called");
        let params_json = serde_json::to_string(&task.params)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) ON CONFLICT DO NOTHING",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.subject_id,
                task.operation,
                params_json,
                task.priority,
                task.retries,
                task.last_error,
                task.status.as_str(),
                task.bulk_id,
                task.created_at,
                task.started_at,
                task.completed_at,
            ],
        )?;

        if inserted == 1 {
            return Ok(InsertOutcome::created(task.id.clone()));
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM tasks WHERE subject_id = ?1 AND operation = ?2 AND status IN ('pending', 'in_progress')",
                params![task.subject_id, task.operation],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                debug!(%id, "SqliteTaskStore::add: identity taken");
                Ok(InsertOutcome::existing(id))
            }
            // Conflict on the primary key itself
            None => Ok(InsertOutcome::existing(task.id.clone())),
        }
    }

    fn get_pending(&self, limit: usize) -> StoreResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = 'pending' ORDER BY priority ASC, created_at ASC, rowid ASC LIMIT ?1",
            TASK_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], Self::row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                [id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    fn update(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        debug!(%id, ?update, "SqliteTaskStore::update: called");
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(priority) = update.priority {
            sets.push("priority = ?");
            values.push(SqlValue::Integer(priority as i64));
        }
        if let Some(retries) = update.retries {
            sets.push("retries = ?");
            values.push(SqlValue::Integer(retries as i64));
        }
        if let Some(last_error) = &update.last_error {
            sets.push("last_error = ?");
            values.push(last_error.clone().map_or(SqlValue::Null, SqlValue::Text));
        }
        if let Some(started_at) = update.started_at {
            sets.push("started_at = ?");
            values.push(started_at.map_or(SqlValue::Null, SqlValue::Integer));
        }
        if let Some(completed_at) = update.completed_at {
            sets.push("completed_at = ?");
            values.push(completed_at.map_or(SqlValue::Null, SqlValue::Integer));
        }

        let conn = self.lock()?;
        if sets.is_empty() {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            return exists
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("task {}", id)));
        }

        values.push(SqlValue::Text(id.to_string()));
        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<bool> {
        debug!(%id, "SqliteTaskStore::remove: called");
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", [id])? > 0)
    }

    fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(operation) = &filter.operation {
            clauses.push("operation = ?");
            values.push(SqlValue::Text(operation.clone()));
        }
        if let Some(bulk_id) = &filter.bulk_id {
            clauses.push("bulk_id = ?");
            values.push(SqlValue::Text(bulk_id.clone()));
        }

        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), Self::row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_by_status(&self) -> StoreResult<HashMap<TaskStatus, usize>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            let status = status.parse::<TaskStatus>().map_err(|_| StoreError::InvalidValue {
                column: "status",
                value: status.clone(),
            })?;
            counts.insert(status, count as usize);
        }
        Ok(counts)
    }
}

impl BlobStore for SqliteTaskStore {
    fn put_blob(&self, namespace: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        let conn = self.blob_conn()?;
        conn.execute(
            "INSERT INTO blobs (namespace, key, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![namespace, key, data, now_ms()],
        )?;
        Ok(())
    }

    fn get_blob(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.blob_conn()?;
        let data = conn
            .query_row(
                "SELECT data FROM blobs WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    fn delete_blob(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let conn = self.blob_conn()?;
        Ok(conn.execute(
            "DELETE FROM blobs WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )? > 0)
    }

    fn list_blobs(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let conn = self.blob_conn()?;
        let mut stmt = conn.prepare("SELECT key, data FROM blobs WHERE namespace = ?1 ORDER BY key ASC")?;
        let rows = stmt.query_map([namespace], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
