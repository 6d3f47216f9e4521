use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::key::TaskKey;

use super::models::TerminalStatus;
use super::store::SqliteTaskStore;
use super::{run_blocking, TaskError, TaskResult};

/// Blocks a request until its task reaches `succeeded` or `failed`.
///
/// Every iteration re-reads the row from the store; nothing is cached between
/// polls, so the waiter observes transitions made by any worker in any process.
#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    store: SqliteTaskStore,
    poll_interval: Duration,
}

impl CompletionWaiter {
    pub fn new(store: SqliteTaskStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// `None` waits without a deadline. An expired deadline leaves the task
    /// as it is; the conversion keeps going in the background.
    pub async fn wait_for_terminal(
        &self,
        key: &TaskKey,
        deadline: Option<Duration>,
    ) -> TaskResult<TerminalStatus> {
        let started = Instant::now();
        let Some(limit) = deadline else {
            return self.poll_until_terminal(key).await;
        };
        match timeout(limit, self.poll_until_terminal(key)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::WaitTimeout {
                key: key.clone(),
                waited: started.elapsed(),
            }),
        }
    }

    async fn poll_until_terminal(&self, key: &TaskKey) -> TaskResult<TerminalStatus> {
        loop {
            let lookup = key.clone();
            match run_blocking(&self.store, move |store| store.fetch_by_key(&lookup)).await {
                Ok(Some(task)) => {
                    if let Some(terminal) = task.status.as_terminal() {
                        return Ok(terminal);
                    }
                    debug!(key = %key, status = %task.status, "task not finished yet");
                }
                Ok(None) => return Err(TaskError::NotFound(key.to_string())),
                Err(err) if err.is_transient() => {
                    warn!(key = %key, error = %err, "task store busy while waiting, retrying");
                }
                Err(err) => return Err(err),
            }
            sleep(self.poll_interval).await;
        }
    }
}
