use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::format::TargetFormat;
use crate::key::{derive_key, TaskKey};
use crate::sqlite::{configure_connection, DEFAULT_BUSY_TIMEOUT};

use super::models::{GetOrCreate, Task, TaskCounts, TaskStatus};
use super::{TaskError, TaskResult};

const TASK_SCHEMA: &str = include_str!("../../../sql/tasks.sql");

#[derive(Debug, Clone)]
pub struct SqliteTaskStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    busy_timeout: Duration,
}

impl Default for SqliteTaskStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl SqliteTaskStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn busy_timeout(mut self, value: Duration) -> Self {
        self.busy_timeout = value;
        self
    }

    pub fn build(self) -> TaskResult<SqliteTaskStore> {
        let path = self.path.ok_or(TaskError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteTaskStore {
            path,
            flags,
            busy_timeout: self.busy_timeout,
        })
    }
}

/// Durable task table shared by every worker and waiter.
///
/// The store holds no connection: each operation opens its own, so clones can
/// be handed to any number of tasks or threads and all coordination happens
/// inside SQLite.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    path: PathBuf,
    flags: OpenFlags,
    busy_timeout: Duration,
}

impl SqliteTaskStore {
    pub fn builder() -> SqliteTaskStoreBuilder {
        SqliteTaskStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> TaskResult<Self> {
        SqliteTaskStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> TaskResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            TaskError::StoreUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn, self.busy_timeout).map_err(|source| {
            TaskError::StoreUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> TaskResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(TASK_SCHEMA)?;
        Ok(())
    }

    /// Returns the task for `(source_url, format)`, creating it as `pending`
    /// on first sight, and counts the request either way.
    ///
    /// Insert, counter bump and read-back run in one immediate transaction so
    /// concurrent first-time callers serialise on the write lock and observe a
    /// single row.
    pub fn get_or_create(&self, source_url: &str, format: TargetFormat) -> TaskResult<GetOrCreate> {
        let key = derive_key(source_url, format);
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO conversion_tasks (task_key, source_url, format, status)
             VALUES (?1, ?2, ?3, 'pending')
             ON CONFLICT(task_key) DO NOTHING",
            params![key.as_str(), source_url, format.as_str()],
        )?;
        tx.execute(
            "UPDATE conversion_tasks SET request_count = request_count + 1 WHERE task_key = ?1",
            [key.as_str()],
        )?;
        let task = tx.query_row(
            "SELECT * FROM conversion_tasks WHERE task_key = ?1",
            [key.as_str()],
            Task::from_row,
        )?;
        if task.source_url != source_url || task.format != format {
            return Err(TaskError::KeyCollision { key });
        }
        tx.commit()?;
        if inserted > 0 {
            debug!(task_id = task.id, key = %task.key, "task created");
        }
        Ok(GetOrCreate {
            task,
            created: inserted > 0,
        })
    }

    pub fn fetch_by_key(&self, key: &TaskKey) -> TaskResult<Option<Task>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "SELECT * FROM conversion_tasks WHERE task_key = ?1",
                [key.as_str()],
                Task::from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn fetch_by_id(&self, id: i64) -> TaskResult<Option<Task>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "SELECT * FROM conversion_tasks WHERE id = ?1",
                [id],
                Task::from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Claims one pending task for the calling worker.
    ///
    /// Selection and the flip to `converting` happen under SQLite's write
    /// lock, taken by `BEGIN IMMEDIATE` and released on commit, so a row is
    /// claimable by at most one caller. The lock never outlives this call.
    /// `Ok(None)` means there was nothing to claim.
    pub fn claim_next(&self) -> TaskResult<Option<Task>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM conversion_tasks WHERE status = 'pending' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };
        let affected = tx.execute(
            "UPDATE conversion_tasks
             SET status = 'converting', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        ensure_transition(&tx, id, TaskStatus::Converting, affected)?;
        let task = tx.query_row(
            "SELECT * FROM conversion_tasks WHERE id = ?1",
            [id],
            Task::from_row,
        )?;
        tx.commit()?;
        Ok(Some(task))
    }

    pub fn mark_converting(&self, id: i64) -> TaskResult<Task> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE conversion_tasks
             SET status = 'converting', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        ensure_transition(&conn, id, TaskStatus::Converting, affected)?;
        self.require(id)
    }

    pub fn mark_succeeded(
        &self,
        id: i64,
        result_location: &str,
        original_filename: Option<&str>,
    ) -> TaskResult<Task> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE conversion_tasks
             SET status = 'succeeded',
                 result_location = ?2,
                 original_filename = ?3,
                 failure_reason = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'converting'",
            params![id, result_location, original_filename],
        )?;
        ensure_transition(&conn, id, TaskStatus::Succeeded, affected)?;
        self.require(id)
    }

    pub fn mark_failed(&self, id: i64, reason: &str) -> TaskResult<Task> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE conversion_tasks
             SET status = 'failed',
                 result_location = NULL,
                 failure_reason = ?2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'converting'",
            params![id, reason],
        )?;
        ensure_transition(&conn, id, TaskStatus::Failed, affected)?;
        self.require(id)
    }

    /// Moves every `converting` task back to `pending`.
    ///
    /// Only safe when no live worker owns a converting row; see
    /// [`RecoverySweeper`](super::RecoverySweeper).
    pub fn reset_stuck(&self) -> TaskResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE conversion_tasks
             SET status = 'pending', updated_at = CURRENT_TIMESTAMP
             WHERE status = 'converting'",
            [],
        )?;
        Ok(affected)
    }

    pub fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> TaskResult<Vec<Task>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM conversion_tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (status.as_ref().map(TaskStatus::as_str), limit as i64),
                Task::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_status(&self) -> TaskResult<TaskCounts> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(request_count), 0)
             FROM conversion_tasks GROUP BY status",
        )?;
        let mut by_status = HashMap::new();
        let mut total = 0;
        let mut total_requests = 0;
        for row in stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })? {
            let (status, count, requests) = row?;
            total += count as usize;
            total_requests += requests;
            by_status.insert(status, count as usize);
        }
        Ok(TaskCounts {
            total,
            by_status,
            total_requests,
        })
    }

    fn require(&self, id: i64) -> TaskResult<Task> {
        self.fetch_by_id(id)?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }
}

/// Turns a conditional update that matched no row into the reason it did not:
/// the task is missing, or its current status does not allow moving to `to`.
fn ensure_transition(
    conn: &Connection,
    id: i64,
    to: TaskStatus,
    affected: usize,
) -> TaskResult<()> {
    if affected > 0 {
        return Ok(());
    }
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM conversion_tasks WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match current {
        None => Err(TaskError::NotFound(id.to_string())),
        Some(status) => Err(TaskError::InvalidTransition {
            id,
            from: status.parse()?,
            to,
        }),
    }
}
