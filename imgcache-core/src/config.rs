use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ImgcacheConfig {
    pub paths: PathsSection,
    pub database: DatabaseSection,
    pub worker: WorkerSection,
    pub transcode: TranscodeSection,
    pub ingress: IngressSection,
}

impl ImgcacheConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.resolve_path(&self.database.tasks_db)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.storage_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.threads == 0 {
            return Err(ConfigError::invalid("worker.threads", "must be at least 1"));
        }
        if self.transcode.webp_quality > 100 {
            return Err(ConfigError::invalid(
                "transcode.webp_quality",
                format!("{} is above 100", self.transcode.webp_quality),
            ));
        }
        if self.transcode.avif_quality > 100 {
            return Err(ConfigError::invalid(
                "transcode.avif_quality",
                format!("{} is above 100", self.transcode.avif_quality),
            ));
        }
        if !(1..=10).contains(&self.transcode.avif_speed) {
            return Err(ConfigError::invalid(
                "transcode.avif_speed",
                format!("{} is outside 1..=10", self.transcode.avif_speed),
            ));
        }
        if self.transcode.webp_method > 6 {
            return Err(ConfigError::invalid(
                "transcode.webp_method",
                format!("{} is outside 0..=6", self.transcode.webp_method),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub storage_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            storage_dir: "data/images".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub tasks_db: String,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            tasks_db: "data/tasks.sqlite".into(),
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseSection {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub threads: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            threads: 2,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub webp_quality: u8,
    /// libwebp effort, 0 (fastest) to 6 (smallest output).
    pub webp_method: u8,
    pub avif_quality: u8,
    /// 1 (slowest, smallest) to 10 (fastest).
    pub avif_speed: u8,
    pub user_agent: String,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            webp_quality: 80,
            webp_method: 4,
            avif_quality: 65,
            avif_speed: 6,
            user_agent: concat!("imgcache/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngressSection {
    /// Shared secret expected in `X-API-Key`; empty disables the check.
    pub api_key: String,
    /// Allowed source domains (subdomains included); empty allows all.
    pub domain_whitelist: Vec<String>,
    /// 0 waits for a terminal status without a deadline.
    pub wait_timeout_seconds: u64,
}

impl IngressSection {
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_seconds > 0).then(|| Duration::from_secs(self.wait_timeout_seconds))
    }
}

pub fn load_imgcache_config<P: AsRef<Path>>(path: P) -> Result<ImgcacheConfig> {
    let config: ImgcacheConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
