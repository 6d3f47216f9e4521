use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid source url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("encoder task aborted: {0}")]
    Aborted(String),
}

impl From<reqwest::Error> for TranscodeError {
    fn from(error: reqwest::Error) -> Self {
        TranscodeError::Network(error.to_string())
    }
}

impl From<std::io::Error> for TranscodeError {
    fn from(source: std::io::Error) -> Self {
        TranscodeError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for TranscodeError {
    fn from(error: tokio::task::JoinError) -> Self {
        TranscodeError::Aborted(error.to_string())
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
