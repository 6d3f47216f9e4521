use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::format::{TargetFormat, UnsupportedFormat};
use crate::key::{InvalidKey, TaskKey};
use crate::task::{run_blocking, SqliteTaskStore, TaskError, TaskStatus};

/// Artifacts never change for a given key, so clients may cache for a year.
pub const CACHE_MAX_AGE_SECS: i64 = 31_536_000;
pub const SERVE_PREFIX: &str = "/img/";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormat),
    #[error("no artifact for {0}")]
    NotFound(String),
    #[error("artifact not ready, original at {original_url}")]
    NotReady { original_url: String },
    #[error("failed to read artifact {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type ServeResult<T> = std::result::Result<T, ServeError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ServedArtifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub filename: String,
    pub cache_control: String,
    pub expires: String,
    pub etag: String,
}

impl ServedArtifact {
    pub fn content_disposition(&self) -> String {
        format!("inline; filename=\"{}\"", self.filename)
    }
}

/// Splits `/img/<key>.<ext>` into its key and format.
pub fn parse_artifact_path(path: &str) -> ServeResult<(TaskKey, TargetFormat)> {
    let name = path
        .strip_prefix(SERVE_PREFIX)
        .ok_or_else(|| ServeError::NotFound(path.to_string()))?;
    let (key, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| ServeError::NotFound(path.to_string()))?;
    Ok((TaskKey::parse(key)?, ext.parse()?))
}

/// Download name for the artifact: the source's name with its extension
/// swapped for the output format, or `image.<ext>`.
pub fn artifact_filename(original: Option<&str>, format: TargetFormat) -> String {
    let ext = format.extension();
    match original.filter(|name| !name.is_empty()) {
        Some(name) => match name.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.{ext}"),
            None => format!("{name}.{ext}"),
        },
        None => format!("image.{ext}"),
    }
}

pub fn expires_header(now: DateTime<Utc>) -> String {
    (now + ChronoDuration::seconds(CACHE_MAX_AGE_SECS))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ArtifactServer {
    store: SqliteTaskStore,
}

impl ArtifactServer {
    pub fn new(store: SqliteTaskStore) -> Self {
        Self { store }
    }

    pub async fn serve_path(&self, path: &str) -> ServeResult<ServedArtifact> {
        let (key, format) = parse_artifact_path(path)?;
        self.serve(&key, format).await
    }

    /// Returns the stored bytes of a succeeded task along with its response
    /// metadata. Reads only; serving never changes task state.
    pub async fn serve(&self, key: &TaskKey, format: TargetFormat) -> ServeResult<ServedArtifact> {
        let lookup = key.clone();
        let task = run_blocking(&self.store, move |store| store.fetch_by_key(&lookup))
            .await?
            .filter(|task| task.format == format)
            .ok_or_else(|| ServeError::NotFound(format!("{key}.{format}")))?;

        let location = match (&task.status, &task.result_location) {
            (TaskStatus::Succeeded, Some(location)) => PathBuf::from(location),
            _ => {
                return Err(ServeError::NotReady {
                    original_url: task.source_url,
                })
            }
        };
        let bytes = tokio::fs::read(&location)
            .await
            .map_err(|source| ServeError::Io {
                source,
                path: location.clone(),
            })?;
        debug!(key = %key, size = bytes.len(), "serving artifact");

        Ok(ServedArtifact {
            bytes,
            content_type: format.mime_type(),
            filename: artifact_filename(task.original_filename.as_deref(), format),
            cache_control: format!("public, max-age={CACHE_MAX_AGE_SECS}, immutable"),
            expires: expires_header(Utc::now()),
            etag: format!("\"{key}\""),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::key::derive_key;

    #[test]
    fn filename_extension_is_replaced() {
        assert_eq!(
            artifact_filename(Some("photo.final.jpg"), TargetFormat::Webp),
            "photo.final.webp"
        );
        assert_eq!(artifact_filename(Some("photo"), TargetFormat::Avif), "photo.avif");
        assert_eq!(artifact_filename(None, TargetFormat::Avif), "image.avif");
    }

    #[test]
    fn expires_is_one_year_ahead_in_http_date_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(expires_header(now), "Sat, 01 Mar 2025 12:00:00 GMT");
    }

    #[test]
    fn artifact_path_round_trips() {
        let key = derive_key("https://example.com/a.jpg", TargetFormat::Webp);
        let (parsed, format) = parse_artifact_path(&format!("/img/{key}.webp")).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(format, TargetFormat::Webp);
        assert!(matches!(
            parse_artifact_path(&format!("/img/{key}.png")),
            Err(ServeError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parse_artifact_path("/img/nope.webp"),
            Err(ServeError::InvalidKey(_))
        ));
    }

    #[test]
    fn paths_outside_the_serve_prefix_are_not_found() {
        let key = derive_key("https://example.com/a.jpg", TargetFormat::Webp);
        for path in [format!("{key}.webp"), format!("/{key}.webp"), format!("/images/{key}.webp")] {
            assert!(
                matches!(parse_artifact_path(&path), Err(ServeError::NotFound(_))),
                "{path} should not resolve"
            );
        }
    }
}
