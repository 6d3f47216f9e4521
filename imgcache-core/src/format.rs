use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported output format: {0}")]
pub struct UnsupportedFormat(pub String);

/// Output formats the cache can produce.
///
/// Every component (key derivation, store, transcoder, ingress and serving)
/// goes through this type instead of comparing raw strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    Webp,
    Avif,
}

impl TargetFormat {
    /// Preference order used when negotiating from an `Accept` header.
    pub const NEGOTIATION_ORDER: [TargetFormat; 2] = [TargetFormat::Avif, TargetFormat::Webp];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Webp => "webp",
            TargetFormat::Avif => "avif",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TargetFormat::Webp => "image/webp",
            TargetFormat::Avif => "image/avif",
        }
    }

    /// Picks the first format in [`Self::NEGOTIATION_ORDER`] that the client
    /// advertises in its `Accept` header.
    pub fn negotiate(accept: &str) -> Option<TargetFormat> {
        let accept = accept.to_ascii_lowercase();
        Self::NEGOTIATION_ORDER
            .into_iter()
            .find(|format| accept.contains(format.mime_type()))
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = UnsupportedFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(TargetFormat::Webp),
            "avif" => Ok(TargetFormat::Avif),
            _ => Err(UnsupportedFormat(s.to_string())),
        }
    }
}
