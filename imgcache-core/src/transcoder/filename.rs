use std::sync::OnceLock;

use regex::Regex;
use url::Url;

pub const FALLBACK_FILENAME: &str = "image.jpg";

fn disposition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"filename="(.+?)""#).expect("valid regex"))
}

pub fn from_content_disposition(header: &str) -> Option<String> {
    disposition_pattern()
        .captures(header)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

pub fn from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .last()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Display name of a downloaded source: the server's `Content-Disposition`
/// name, else the last path segment, else [`FALLBACK_FILENAME`] when neither
/// carries an extension.
pub fn resolve(content_disposition: Option<&str>, url: &str) -> String {
    content_disposition
        .and_then(from_content_disposition)
        .or_else(|| from_url(url))
        .filter(|name| name.contains('.'))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_header_wins() {
        let name = resolve(
            Some(r#"attachment; filename="holiday.png""#),
            "https://example.com/download?id=4",
        );
        assert_eq!(name, "holiday.png");
    }

    #[test]
    fn falls_back_to_last_path_segment_without_query() {
        assert_eq!(
            resolve(None, "https://example.com/photos/cat.jpeg?size=large"),
            "cat.jpeg"
        );
    }

    #[test]
    fn names_without_extension_become_default() {
        assert_eq!(resolve(None, "https://example.com/photos/cat"), "image.jpg");
        assert_eq!(resolve(None, "https://example.com/"), "image.jpg");
        assert_eq!(resolve(Some("inline"), "not a url"), "image.jpg");
    }
}
