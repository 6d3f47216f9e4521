use std::time::Duration;

use rusqlite::{Connection, ErrorCode};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Applies the pragmas every task-store connection runs with.
///
/// The busy timeout is installed before switching the journal mode so that
/// concurrent openers wait for each other instead of failing outright.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA foreign_keys = ON;\n",
    )
}

/// True when SQLite gave up waiting for a lock held by another connection.
pub fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
