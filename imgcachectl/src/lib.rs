use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use imgcache_core::{
    derive_key, load_imgcache_config, ArtifactServer, CompletionWaiter, Gateway, ImageTranscoder,
    ImgcacheConfig, IngressOutcome, IngressRequest, RecoverySweeper, SqliteTaskStore,
    TargetFormat, Task, TaskCounts, TaskKey, TaskStatus, WorkerConfig, WorkerPool,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] imgcache_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task error: {0}")]
    Task(#[from] imgcache_core::TaskError),
    #[error("transcoder error: {0}")]
    Transcode(#[from] imgcache_core::TranscodeError),
    #[error("request rejected ({}): {0}", .0.status_code())]
    Ingress(#[from] imgcache_core::IngressError),
    #[error("serve error: {0}")]
    Serve(#[from] imgcache_core::ServeError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Image transcoding cache control interface", long_about = None)]
pub struct Cli {
    /// Path to imgcache.toml
    #[arg(long, default_value = "configs/imgcache.toml")]
    pub config: PathBuf,
    /// Overrides database.tasks_db
    #[arg(long)]
    pub tasks_db: Option<PathBuf>,
    /// Overrides paths.storage_dir
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,
    /// Local auth token (required when IMGCACHECTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates the task database and storage directory
    Init,
    /// Prints the cache key of a source url
    Key(KeyArgs),
    /// Requests a conversion and waits for its outcome
    Request(RequestArgs),
    /// Reads a converted artifact
    Serve(ServeArgs),
    /// Runs the worker pool until interrupted
    Worker(WorkerArgs),
    /// Resets tasks left in `converting` by a crashed run
    Sweep,
    /// Task inspection
    #[command(subcommand)]
    Task(TaskCommands),
    /// Summarises the task table
    Status,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    pub url: String,
    #[arg(long, default_value = "webp")]
    pub target: String,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Request path, e.g. `/https://example.com/a.jpg`
    pub path: String,
    /// Explicit output format
    #[arg(long)]
    pub target: Option<String>,
    /// Accept header used for negotiation when no target is given
    #[arg(long)]
    pub accept: Option<String>,
    /// Value of X-API-Key
    #[arg(long)]
    pub api_key: Option<String>,
    /// Overrides ingress.wait_timeout_seconds
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
    /// Runs a worker pool in this process while waiting
    #[arg(long, default_value_t = false)]
    pub work: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Artifact path, e.g. `/img/<key>.webp`
    pub path: String,
    /// Writes the artifact bytes to this file
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Overrides worker.threads
    #[arg(long)]
    pub threads: Option<usize>,
    /// Overrides worker.poll_interval_ms
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
    /// Skips the startup reset of `converting` tasks; use when another
    /// worker may be running against the same database
    #[arg(long)]
    pub no_sweep: bool,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Lists tasks, most recently updated first
    List(TaskListArgs),
    /// Shows one task by key
    Show(TaskShowArgs),
}

#[derive(Args, Debug)]
pub struct TaskListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct TaskShowArgs {
    pub key: String,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Init => render(&context.init()?, cli.format)?,
        Commands::Key(args) => render(&context.key(args)?, cli.format)?,
        Commands::Request(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(context.request(args))?;
            render(&report, cli.format)?;
        }
        Commands::Serve(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(context.serve(args))?;
            render(&report, cli.format)?;
        }
        Commands::Worker(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(context.worker(args))?;
        }
        Commands::Sweep => render(&context.sweep()?, cli.format)?,
        Commands::Task(TaskCommands::List(args)) => {
            render(&context.task_list(args)?, cli.format)?
        }
        Commands::Task(TaskCommands::Show(args)) => {
            render(&context.task_show(args)?, cli.format)?
        }
        Commands::Status => render(&context.status()?, cli.format)?,
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("IMGCACHECTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ImgcacheConfig,
    tasks_db: PathBuf,
    storage_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_imgcache_config(&cli.config)?;
        let tasks_db = cli
            .tasks_db
            .clone()
            .unwrap_or_else(|| config.tasks_db_path());
        let storage_dir = cli
            .storage_dir
            .clone()
            .unwrap_or_else(|| config.storage_dir());
        Ok(Self {
            config,
            tasks_db,
            storage_dir,
        })
    }

    fn store(&self) -> Result<SqliteTaskStore> {
        let store = SqliteTaskStore::builder()
            .path(&self.tasks_db)
            .busy_timeout(self.config.database.busy_timeout())
            .build()?;
        Ok(store)
    }

    /// Store for commands that must not create a database as a side effect.
    fn existing_store(&self) -> Result<SqliteTaskStore> {
        if !self.tasks_db.exists() {
            return Err(AppError::InvalidArgument(format!(
                "task database missing at {} (run `imgcachectl init`)",
                self.tasks_db.display()
            )));
        }
        self.store()
    }

    fn waiter(&self, store: &SqliteTaskStore) -> CompletionWaiter {
        CompletionWaiter::new(store.clone(), self.config.worker.poll_interval())
    }

    fn init(&self) -> Result<InitReport> {
        self.store()?.initialize()?;
        fs::create_dir_all(&self.storage_dir)?;
        Ok(InitReport {
            tasks_db: self.tasks_db.clone(),
            storage_dir: self.storage_dir.clone(),
        })
    }

    fn key(&self, args: &KeyArgs) -> Result<KeyReport> {
        let format: TargetFormat = args
            .target
            .parse()
            .map_err(|err: imgcache_core::UnsupportedFormat| {
                AppError::InvalidArgument(err.to_string())
            })?;
        let key = derive_key(&args.url, format);
        Ok(KeyReport {
            location: format!("/img/{key}.{}", format.extension()),
            key,
            format,
        })
    }

    async fn request(&self, args: &RequestArgs) -> Result<RequestReport> {
        let store = self.existing_store()?;
        let mut ingress = self.config.ingress.clone();
        if let Some(seconds) = args.timeout_seconds {
            ingress.wait_timeout_seconds = seconds;
        }
        let gateway = Gateway::new(store.clone(), self.waiter(&store), ingress);

        let mut request = IngressRequest::new(args.path.clone());
        request.format = args.target.clone();
        request.accept = args.accept.clone();
        request.api_key = args.api_key.clone();

        let outcome = if args.work {
            let (shutdown, pool) = self.spawn_pool(&store, self.request_worker_config())?;
            let outcome = gateway.resolve(&request).await;
            let _ = shutdown.send(true);
            pool.await
                .map_err(|err| AppError::Io(std::io::Error::other(err)))??;
            outcome?
        } else {
            gateway.resolve(&request).await?
        };
        Ok(RequestReport::from(outcome))
    }

    async fn serve(&self, args: &ServeArgs) -> Result<ServeReport> {
        let server = ArtifactServer::new(self.existing_store()?);
        let artifact = server.serve_path(&args.path).await?;
        if let Some(output) = &args.output {
            tokio::fs::write(output, &artifact.bytes).await?;
        }
        Ok(ServeReport {
            content_type: artifact.content_type.to_string(),
            content_disposition: artifact.content_disposition(),
            cache_control: artifact.cache_control,
            expires: artifact.expires,
            etag: artifact.etag,
            size: artifact.bytes.len(),
            written_to: args.output.clone(),
        })
    }

    /// Workers started next to a single request run alongside whatever
    /// else is converting, so they never sweep.
    fn request_worker_config(&self) -> WorkerConfig {
        WorkerConfig::from(&self.config.worker).with_sweep_on_start(false)
    }

    fn daemon_worker_config(&self, args: &WorkerArgs) -> WorkerConfig {
        let mut config =
            WorkerConfig::from(&self.config.worker).with_sweep_on_start(!args.no_sweep);
        if let Some(threads) = args.threads {
            config.threads = threads.max(1);
        }
        if let Some(ms) = args.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        config
    }

    async fn worker(&self, args: &WorkerArgs) -> Result<()> {
        let store = self.existing_store()?;
        let (shutdown, pool) = self.spawn_pool(&store, self.daemon_worker_config(args))?;
        tokio::signal::ctrl_c().await?;
        info!("interrupt received, finishing in-flight conversions");
        let _ = shutdown.send(true);
        pool.await
            .map_err(|err| AppError::Io(std::io::Error::other(err)))??;
        Ok(())
    }

    fn spawn_pool(
        &self,
        store: &SqliteTaskStore,
        config: WorkerConfig,
    ) -> Result<(
        watch::Sender<bool>,
        tokio::task::JoinHandle<imgcache_core::TaskResult<()>>,
    )> {
        let transcoder = Arc::new(ImageTranscoder::new(
            &self.storage_dir,
            &self.config.transcode,
        )?);
        let pool = WorkerPool::new(store.clone(), transcoder, config);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { pool.run(rx).await });
        Ok((shutdown, handle))
    }

    fn sweep(&self) -> Result<SweepReport> {
        let sweeper = RecoverySweeper::new(self.existing_store()?);
        Ok(SweepReport {
            reset: sweeper.sweep()?,
        })
    }

    fn task_list(&self, args: &TaskListArgs) -> Result<TaskList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        let rows = self.existing_store()?.list_by_status(status, args.limit)?;
        Ok(TaskList { rows })
    }

    fn task_show(&self, args: &TaskShowArgs) -> Result<Task> {
        let key = TaskKey::parse(&args.key)
            .map_err(|err| AppError::InvalidArgument(err.to_string()))?;
        self.existing_store()?
            .fetch_by_key(&key)?
            .ok_or_else(|| AppError::Task(imgcache_core::TaskError::NotFound(key.to_string())))
    }

    fn status(&self) -> Result<StatusReport> {
        let counts = self.existing_store()?.count_by_status()?;
        Ok(StatusReport {
            generated_at: Utc::now(),
            tasks_db: self.tasks_db.clone(),
            storage_dir: self.storage_dir.clone(),
            worker_threads: self.config.worker.threads,
            counts,
        })
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub tasks_db: PathBuf,
    pub storage_dir: PathBuf,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        format!(
            "Task database ready at {}\nStorage directory: {}",
            display_path(&self.tasks_db),
            display_path(&self.storage_dir)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct KeyReport {
    pub key: TaskKey,
    pub format: TargetFormat,
    pub location: String,
}

impl DisplayFallback for KeyReport {
    fn display(&self) -> String {
        format!("{} ({}) -> {}", self.key, self.format, self.location)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestReport {
    Converted {
        key: TaskKey,
        format: TargetFormat,
        location: String,
    },
    Fallback {
        redirect: String,
    },
    Passthrough {
        redirect: String,
    },
}

impl From<IngressOutcome> for RequestReport {
    fn from(outcome: IngressOutcome) -> Self {
        match outcome {
            IngressOutcome::Converted {
                key,
                format,
                location,
            } => RequestReport::Converted {
                key,
                format,
                location,
            },
            IngressOutcome::Fallback { original_url } => RequestReport::Fallback {
                redirect: original_url,
            },
            IngressOutcome::Passthrough { original_url } => RequestReport::Passthrough {
                redirect: original_url,
            },
        }
    }
}

impl DisplayFallback for RequestReport {
    fn display(&self) -> String {
        match self {
            RequestReport::Converted { location, .. } => format!("converted -> {location}"),
            RequestReport::Fallback { redirect } => {
                format!("conversion failed, redirect to {redirect}")
            }
            RequestReport::Passthrough { redirect } => {
                format!("no supported format accepted, redirect to {redirect}")
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServeReport {
    pub content_type: String,
    pub content_disposition: String,
    pub cache_control: String,
    pub expires: String,
    pub etag: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_to: Option<PathBuf>,
}

impl DisplayFallback for ServeReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Content-Type: {}", self.content_type),
            format!("Content-Disposition: {}", self.content_disposition),
            format!("Cache-Control: {}", self.cache_control),
            format!("Expires: {}", self.expires),
            format!("ETag: {}", self.etag),
            format!("Size: {} bytes", self.size),
        ];
        if let Some(path) = &self.written_to {
            lines.push(format!("Written to {}", display_path(path)));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub reset: usize,
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        format!("{} task(s) returned to pending", self.reset)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<Task>,
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No tasks found".to_string();
        }
        self.rows
            .iter()
            .map(|task| {
                format!(
                    "#{id} {status:<10} {format} requests={count} {url}",
                    id = task.id,
                    status = task.status.as_str(),
                    format = task.format,
                    count = task.request_count,
                    url = task.source_url
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Task {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Task #{} ({})", self.id, self.status),
            format!("  key: {}", self.key),
            format!("  source: {}", self.source_url),
            format!("  format: {}", self.format),
            format!("  requests: {}", self.request_count),
        ];
        if let Some(location) = &self.result_location {
            lines.push(format!("  artifact: {location}"));
            lines.push(format!("  served at: {}", self.serve_path()));
        }
        if let Some(reason) = &self.failure_reason {
            lines.push(format!("  failure: {reason}"));
        }
        if let Some(updated) = &self.updated_at {
            lines.push(format!("  updated: {}", updated.to_rfc3339()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub tasks_db: PathBuf,
    pub storage_dir: PathBuf,
    pub worker_threads: usize,
    pub counts: TaskCounts,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Database: {}", display_path(&self.tasks_db)),
            format!("Storage: {}", display_path(&self.storage_dir)),
            format!("Worker threads: {}", self.worker_threads),
            format!(
                "Tasks: {} ({} requests)",
                self.counts.total, self.counts.total_requests
            ),
        ];
        for status in TaskStatus::ALL {
            lines.push(format!("  - {status}: {}", self.counts.get(status)));
        }
        lines.join("\n")
    }
}
