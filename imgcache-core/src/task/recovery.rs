use tracing::{info, warn};

use super::store::SqliteTaskStore;
use super::TaskResult;

/// Returns tasks orphaned by a crashed worker to the queue.
///
/// The sweep resets every `converting` row regardless of who owns it, so it
/// must run before any worker of the deployment starts claiming.
#[derive(Debug, Clone)]
pub struct RecoverySweeper {
    store: SqliteTaskStore,
}

impl RecoverySweeper {
    pub fn new(store: SqliteTaskStore) -> Self {
        Self { store }
    }

    pub fn sweep(&self) -> TaskResult<usize> {
        let reset = self.store.reset_stuck()?;
        if reset > 0 {
            warn!(reset, "reset converting tasks left by a previous run");
        } else {
            info!("no stuck tasks to recover");
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TargetFormat;
    use crate::task::TaskStatus;
    use tempfile::TempDir;

    #[test]
    fn sweep_requeues_converting_and_leaves_terminal_rows() {
        let dir = TempDir::new().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("tasks.sqlite")).unwrap();
        store.initialize().unwrap();

        let stuck = store
            .get_or_create("https://example.com/a.jpg", TargetFormat::Webp)
            .unwrap()
            .task;
        let done = store
            .get_or_create("https://example.com/b.jpg", TargetFormat::Webp)
            .unwrap()
            .task;
        store.mark_converting(stuck.id).unwrap();
        store.mark_converting(done.id).unwrap();
        store.mark_succeeded(done.id, "/tmp/b.webp", None).unwrap();

        let sweeper = RecoverySweeper::new(store.clone());
        assert_eq!(sweeper.sweep().unwrap(), 1);
        assert_eq!(
            store.fetch_by_id(stuck.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(
            store.fetch_by_id(done.id).unwrap().unwrap().status,
            TaskStatus::Succeeded
        );
        assert_eq!(sweeper.sweep().unwrap(), 0);
    }
}
