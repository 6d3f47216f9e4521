use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::WorkerSection;
use crate::transcoder::Transcoder;

use super::models::{Task, TaskStatus};
use super::recovery::RecoverySweeper;
use super::store::SqliteTaskStore;
use super::{run_blocking, TaskError, TaskResult};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub threads: usize,
    pub poll_interval: Duration,
    /// Reset every `converting` row before the first claim. Only for a
    /// coordinated restart: it also resets rows owned by live workers
    /// elsewhere.
    pub sweep_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            poll_interval: Duration::from_secs(1),
            sweep_on_start: false,
        }
    }
}

impl From<&WorkerSection> for WorkerConfig {
    fn from(section: &WorkerSection) -> Self {
        Self {
            threads: section.threads.max(1),
            poll_interval: section.poll_interval(),
            sweep_on_start: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_sweep_on_start(mut self, value: bool) -> Self {
        self.sweep_on_start = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Succeeded(Task),
    Failed(Task),
}

/// Claims pending tasks and drives each one to a terminal status.
pub struct ConversionWorker<T: Transcoder + ?Sized> {
    name: String,
    store: SqliteTaskStore,
    transcoder: Arc<T>,
    poll_interval: Duration,
}

impl<T: Transcoder + ?Sized> Clone for ConversionWorker<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            transcoder: Arc::clone(&self.transcoder),
            poll_interval: self.poll_interval,
        }
    }
}

impl<T: Transcoder + ?Sized + 'static> ConversionWorker<T> {
    pub fn new(
        name: impl Into<String>,
        store: SqliteTaskStore,
        transcoder: Arc<T>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            transcoder,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Processes at most one task.
    ///
    /// Transcode failures end up in the task row, never in the returned
    /// error. `Err` means the claim could not be made or the outcome could
    /// not be recorded for a non-transient reason.
    pub async fn tick(&self) -> TaskResult<TickOutcome> {
        let Some(task) = run_blocking(&self.store, |store| store.claim_next()).await? else {
            return Ok(TickOutcome::Idle);
        };
        info!(worker = %self.name, task_id = task.id, key = %task.key, "claimed task");

        let id = task.id;
        match self
            .transcoder
            .transcode(&task.source_url, task.format, id)
            .await
        {
            Ok(output) => {
                let location = output.result_location.to_string_lossy().into_owned();
                let filename = output.original_filename;
                let updated = self
                    .record_outcome(id, TaskStatus::Succeeded, move |store| {
                        store.mark_succeeded(id, &location, filename.as_deref())
                    })
                    .await?;
                info!(worker = %self.name, task_id = id, "conversion succeeded");
                Ok(TickOutcome::Succeeded(updated))
            }
            Err(err) => {
                warn!(worker = %self.name, task_id = id, error = %err, "conversion failed");
                let reason = err.to_string();
                let updated = self
                    .record_outcome(id, TaskStatus::Failed, move |store| {
                        store.mark_failed(id, &reason)
                    })
                    .await?;
                Ok(TickOutcome::Failed(updated))
            }
        }
    }

    /// Writes a terminal status, retrying every `poll_interval` while the
    /// store is busy or unreachable. Nothing else will move a claimed row
    /// out of `converting`.
    async fn record_outcome<F>(&self, id: i64, target: TaskStatus, write: F) -> TaskResult<Task>
    where
        F: Fn(&SqliteTaskStore) -> TaskResult<Task> + Clone + Send + 'static,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match run_blocking(&self.store, write.clone()).await {
                Ok(task) => return Ok(task),
                Err(err) if err.is_transient() => {
                    warn!(
                        worker = %self.name,
                        task_id = id,
                        attempts,
                        error = %err,
                        "task store busy while recording outcome, retrying"
                    );
                    sleep(self.poll_interval).await;
                }
                // An earlier attempt committed but its read-back failed.
                Err(TaskError::InvalidTransition { from, .. })
                    if attempts > 1 && from == target =>
                {
                    return run_blocking(&self.store, move |store| {
                        store
                            .fetch_by_id(id)?
                            .ok_or_else(|| TaskError::NotFound(id.to_string()))
                    })
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Claim loop. Returns once `shutdown` turns true; a task already claimed
    /// is finished first.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "worker started");
        while !*shutdown.borrow() {
            let idle = match self.tick().await {
                Ok(TickOutcome::Idle) => true,
                Ok(_) => false,
                Err(err) if err.is_transient() => {
                    warn!(worker = %self.name, error = %err, "task store busy, backing off");
                    true
                }
                Err(err) => {
                    error!(worker = %self.name, error = %err, "task store error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker = %self.name, "worker stopped");
    }
}

/// Runs `threads` claim loops until shutdown, optionally preceded by the
/// recovery sweep.
pub struct WorkerPool<T: Transcoder + ?Sized> {
    store: SqliteTaskStore,
    transcoder: Arc<T>,
    config: WorkerConfig,
}

impl<T: Transcoder + ?Sized + 'static> WorkerPool<T> {
    pub fn new(store: SqliteTaskStore, transcoder: Arc<T>, config: WorkerConfig) -> Self {
        Self {
            store,
            transcoder,
            config,
        }
    }

    pub fn workers(&self) -> Vec<ConversionWorker<T>> {
        (0..self.config.threads.max(1))
            .map(|idx| {
                ConversionWorker::new(
                    format!("worker-{idx}"),
                    self.store.clone(),
                    Arc::clone(&self.transcoder),
                    self.config.poll_interval,
                )
            })
            .collect()
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> TaskResult<()> {
        if self.config.sweep_on_start {
            run_blocking(&self.store, |store| RecoverySweeper::new(store.clone()).sweep()).await?;
        }

        let handles = self
            .workers()
            .into_iter()
            .map(|worker| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run_loop(shutdown).await })
            })
            .collect::<Vec<_>>();
        info!(threads = handles.len(), "worker pool running");

        for joined in join_all(handles).await {
            joined.map_err(|err| TaskError::Io(std::io::Error::other(err)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use super::*;
    use crate::format::TargetFormat;
    use crate::task::TaskStatus;
    use crate::transcoder::{TranscodeError, TranscodeOutput, TranscodeResult};

    struct ScriptedTranscoder {
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcoder for ScriptedTranscoder {
        async fn transcode(
            &self,
            _source_url: &str,
            format: TargetFormat,
            task_id: i64,
        ) -> TranscodeResult<TranscodeOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.fail {
                return Err(TranscodeError::Download("HTTP 404".into()));
            }
            Ok(TranscodeOutput {
                result_location: format!("/srv/{task_id}/converted.{}", format.extension()).into(),
                original_filename: Some("a.jpg".into()),
            })
        }
    }

    fn setup(fail: bool) -> (TempDir, SqliteTaskStore, Arc<ScriptedTranscoder>) {
        setup_with_delay(fail, Duration::ZERO)
    }

    fn setup_with_delay(
        fail: bool,
        delay: Duration,
    ) -> (TempDir, SqliteTaskStore, Arc<ScriptedTranscoder>) {
        let dir = TempDir::new().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("tasks.sqlite")).unwrap();
        store.initialize().unwrap();
        let transcoder = Arc::new(ScriptedTranscoder {
            fail,
            delay,
            calls: AtomicUsize::new(0),
        });
        (dir, store, transcoder)
    }

    /// Takes the database write lock from another connection while the
    /// conversion is in flight and keeps it past the end of the transcode.
    struct LockHoldingTranscoder {
        db: PathBuf,
        hold: Duration,
        holder: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    #[async_trait]
    impl Transcoder for LockHoldingTranscoder {
        async fn transcode(
            &self,
            _source_url: &str,
            format: TargetFormat,
            task_id: i64,
        ) -> TranscodeResult<TranscodeOutput> {
            let (locked_tx, locked_rx) = oneshot::channel();
            let db = self.db.clone();
            let hold = self.hold;
            let holder = std::thread::spawn(move || {
                let conn = rusqlite::Connection::open(db).unwrap();
                conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(hold);
                conn.execute_batch("COMMIT").unwrap();
            });
            *self.holder.lock().unwrap() = Some(holder);
            locked_rx.await.unwrap();
            sleep(Duration::from_millis(100)).await;
            Ok(TranscodeOutput {
                result_location: format!("/srv/{task_id}/converted.{}", format.extension()).into(),
                original_filename: None,
            })
        }
    }

    #[tokio::test]
    async fn tick_is_idle_on_empty_queue() {
        let (_dir, store, transcoder) = setup(false);
        let worker = ConversionWorker::new("w", store, transcoder, Duration::from_millis(5));
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn successful_transcode_records_location() {
        let (_dir, store, transcoder) = setup(false);
        let task = store
            .get_or_create("https://example.com/a.jpg", TargetFormat::Webp)
            .unwrap()
            .task;
        let worker =
            ConversionWorker::new("w", store.clone(), transcoder, Duration::from_millis(5));

        let TickOutcome::Succeeded(done) = worker.tick().await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(done.id, task.id);
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(
            done.result_location.as_deref(),
            Some(format!("/srv/{}/converted.webp", task.id).as_str())
        );
        assert_eq!(done.original_filename.as_deref(), Some("a.jpg"));
    }

    #[tokio::test]
    async fn failed_transcode_is_terminal_and_not_reclaimed() {
        let (_dir, store, transcoder) = setup(true);
        store
            .get_or_create("https://example.com/missing.jpg", TargetFormat::Avif)
            .unwrap();
        let worker = ConversionWorker::new(
            "w",
            store.clone(),
            Arc::clone(&transcoder),
            Duration::from_millis(5),
        );

        let TickOutcome::Failed(failed) = worker.tick().await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("HTTP 404"));
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let (_dir, store, transcoder) = setup(false);
        for idx in 0..6 {
            store
                .get_or_create(&format!("https://example.com/{idx}.jpg"), TargetFormat::Webp)
                .unwrap();
        }
        let pool = WorkerPool::new(
            store.clone(),
            Arc::clone(&transcoder),
            WorkerConfig {
                threads: 3,
                poll_interval: Duration::from_millis(5),
                sweep_on_start: false,
            },
        );
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(async move { pool.run(rx).await });

        for _ in 0..400 {
            if store.count_by_status().unwrap().get(TaskStatus::Succeeded) == 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(store.count_by_status().unwrap().get(TaskStatus::Succeeded), 6);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn outcome_is_recorded_once_a_busy_store_frees_up() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tasks.sqlite");
        let store = SqliteTaskStore::builder()
            .path(&db)
            .busy_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        store.initialize().unwrap();
        let task = store
            .get_or_create("https://example.com/a.jpg", TargetFormat::Webp)
            .unwrap()
            .task;
        let transcoder = Arc::new(LockHoldingTranscoder {
            db,
            hold: Duration::from_millis(400),
            holder: Mutex::new(None),
        });
        let worker = ConversionWorker::new(
            "w",
            store.clone(),
            Arc::clone(&transcoder),
            Duration::from_millis(20),
        );

        let TickOutcome::Succeeded(done) = worker.tick().await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(done.id, task.id);
        let stored = store.fetch_by_id(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert!(stored.result_location.is_some());

        let holder = transcoder.holder.lock().unwrap().take().unwrap();
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn pool_without_sweep_leaves_live_claims_alone() {
        let (_dir, store, transcoder) = setup_with_delay(false, Duration::from_millis(300));
        store
            .get_or_create("https://example.com/slow.jpg", TargetFormat::Webp)
            .unwrap();

        let first = WorkerPool::new(
            store.clone(),
            Arc::clone(&transcoder),
            WorkerConfig {
                threads: 1,
                poll_interval: Duration::from_millis(5),
                sweep_on_start: true,
            },
        );
        let (first_tx, first_rx) = watch::channel(false);
        let first_run = tokio::spawn(async move { first.run(first_rx).await });

        sleep(Duration::from_millis(100)).await;
        assert_eq!(store.count_by_status().unwrap().get(TaskStatus::Converting), 1);

        let second = WorkerPool::new(
            store.clone(),
            Arc::clone(&transcoder),
            WorkerConfig {
                threads: 1,
                poll_interval: Duration::from_millis(5),
                sweep_on_start: false,
            },
        );
        let (second_tx, second_rx) = watch::channel(false);
        let second_run = tokio::spawn(async move { second.run(second_rx).await });

        for _ in 0..200 {
            if store.count_by_status().unwrap().get(TaskStatus::Succeeded) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        first_tx.send(true).unwrap();
        second_tx.send(true).unwrap();
        first_run.await.unwrap().unwrap();
        second_run.await.unwrap().unwrap();

        assert_eq!(store.count_by_status().unwrap().get(TaskStatus::Succeeded), 1);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweeping_pool_picks_up_abandoned_claims() {
        let (_dir, store, transcoder) = setup(false);
        store
            .get_or_create("https://example.com/a.jpg", TargetFormat::Webp)
            .unwrap();
        store.claim_next().unwrap().unwrap();

        let pool = WorkerPool::new(
            store.clone(),
            Arc::clone(&transcoder),
            WorkerConfig::default().with_sweep_on_start(true),
        );
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(async move { pool.run(rx).await });

        for _ in 0..200 {
            if store.count_by_status().unwrap().get(TaskStatus::Succeeded) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(store.count_by_status().unwrap().get(TaskStatus::Succeeded), 1);
    }
}
