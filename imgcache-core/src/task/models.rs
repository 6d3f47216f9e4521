use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::format::TargetFormat;
use crate::key::TaskKey;

use super::error::TaskError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Converting,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Converting,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Converting => "converting",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Transition table of the task state machine.
    ///
    /// `Converting -> Pending` is only ever issued by the startup recovery
    /// sweep.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Converting)
                | (TaskStatus::Converting, TaskStatus::Succeeded)
                | (TaskStatus::Converting, TaskStatus::Failed)
                | (TaskStatus::Converting, TaskStatus::Pending)
        )
    }

    pub fn as_terminal(&self) -> Option<TerminalStatus> {
        match self {
            TaskStatus::Succeeded => Some(TerminalStatus::Succeeded),
            TaskStatus::Failed => Some(TerminalStatus::Failed),
            TaskStatus::Pending | TaskStatus::Converting => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "converting" => Ok(TaskStatus::Converting),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub key: TaskKey,
    pub source_url: String,
    pub format: TargetFormat,
    pub status: TaskStatus,
    pub result_location: Option<String>,
    pub original_filename: Option<String>,
    pub failure_reason: Option<String>,
    pub request_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        let key: String = row.get("task_key")?;
        let format: String = row.get("format")?;
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            key: TaskKey::parse(&key).map_err(|err| conversion_error(Type::Text, err))?,
            source_url: row.get("source_url")?,
            format: format
                .parse()
                .map_err(|err| conversion_error(Type::Text, err))?,
            status: status
                .parse()
                .map_err(|err| conversion_error(Type::Text, err))?,
            result_location: row.get("result_location")?,
            original_filename: row.get("original_filename")?,
            failure_reason: row.get("failure_reason")?,
            request_count: row.get("request_count")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    /// Path under which the artifact is published, e.g. `/img/<key>.webp`.
    pub fn serve_path(&self) -> String {
        format!("/img/{}.{}", self.key, self.format.extension())
    }
}

fn conversion_error<E>(ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, ty, Box::new(err))
}

/// Result of [`SqliteTaskStore::get_or_create`](super::SqliteTaskStore::get_or_create).
#[derive(Debug, Clone, PartialEq)]
pub struct GetOrCreate {
    pub task: Task,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TaskCounts {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub total_requests: i64,
}

impl TaskCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_only_reaches_converting() {
        for to in TaskStatus::ALL {
            assert_eq!(
                TaskStatus::can_transition(TaskStatus::Pending, to),
                to == TaskStatus::Converting
            );
        }
    }

    #[test]
    fn converting_reaches_terminal_states_or_pending() {
        assert!(TaskStatus::can_transition(
            TaskStatus::Converting,
            TaskStatus::Succeeded
        ));
        assert!(TaskStatus::can_transition(
            TaskStatus::Converting,
            TaskStatus::Failed
        ));
        assert!(TaskStatus::can_transition(
            TaskStatus::Converting,
            TaskStatus::Pending
        ));
        assert!(!TaskStatus::can_transition(
            TaskStatus::Converting,
            TaskStatus::Converting
        ));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for from in [TaskStatus::Succeeded, TaskStatus::Failed] {
            assert!(from.terminal());
            for to in TaskStatus::ALL {
                assert!(!TaskStatus::can_transition(from, to));
            }
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
