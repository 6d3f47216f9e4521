pub mod config;
pub mod error;
pub mod format;
pub mod ingress;
pub mod key;
pub mod serve;
pub mod sqlite;
pub mod task;
pub mod transcoder;

pub use config::{
    load_imgcache_config, DatabaseSection, ImgcacheConfig, IngressSection, PathsSection,
    TranscodeSection, WorkerSection,
};
pub use error::{ConfigError, Result};
pub use format::{TargetFormat, UnsupportedFormat};
pub use ingress::{Gateway, IngressError, IngressOutcome, IngressRequest, IngressResult};
pub use key::{derive_key, InvalidKey, TaskKey};
pub use serve::{ArtifactServer, ServeError, ServeResult, ServedArtifact};
pub use task::{
    CompletionWaiter, ConversionWorker, GetOrCreate, RecoverySweeper, SqliteTaskStore,
    SqliteTaskStoreBuilder, Task, TaskCounts, TaskError, TaskResult, TaskStatus, TerminalStatus,
    TickOutcome, WorkerConfig, WorkerPool,
};
pub use transcoder::{
    EncodeSettings, ImageTranscoder, TranscodeError, TranscodeOutput, TranscodeResult, Transcoder,
};
