mod error;
mod models;
mod recovery;
mod store;
mod waiter;
mod worker;

pub use error::{TaskError, TaskResult};
pub use models::{GetOrCreate, Task, TaskCounts, TaskStatus, TerminalStatus};
pub use recovery::RecoverySweeper;
pub use store::{SqliteTaskStore, SqliteTaskStoreBuilder};
pub use waiter::CompletionWaiter;
pub use worker::{ConversionWorker, TickOutcome, WorkerConfig, WorkerPool};

/// Runs a synchronous store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &SqliteTaskStore, op: F) -> TaskResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteTaskStore) -> TaskResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|err| TaskError::Io(std::io::Error::other(err)))?
}
