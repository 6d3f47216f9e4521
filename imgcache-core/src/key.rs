use std::fmt;
use std::str::FromStr;

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::format::TargetFormat;

const KEY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task key: {0}")]
pub struct InvalidKey(pub String);

/// Content-addressed identifier of a `(source_url, format)` pair.
///
/// Doubles as the dedup key of the task table and as the public name of the
/// cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Accepts only the canonical rendering: 64 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self, InvalidKey> {
        let valid = value.len() == KEY_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidKey(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKey::parse(s)
    }
}

impl AsRef<str> for TaskKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// SHA-256 of `"{source_url}:{format}"`, hex encoded.
///
/// The format is always the trailing component and never contains `:`, so
/// the last separator splits the input unambiguously.
pub fn derive_key(source_url: &str, format: TargetFormat) -> TaskKey {
    let mut hasher = Sha256::new();
    hasher.update(source_url.as_bytes());
    hasher.update(b":");
    hasher.update(format.as_str().as_bytes());
    TaskKey(hex_encode(hasher.finalize()))
}
