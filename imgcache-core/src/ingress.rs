use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::IngressSection;
use crate::format::{TargetFormat, UnsupportedFormat};
use crate::key::TaskKey;
use crate::task::{run_blocking, CompletionWaiter, SqliteTaskStore, TaskError, TerminalStatus};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("unauthorized: invalid or missing API key")]
    Unauthorized,
    #[error("invalid source url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormat),
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl IngressError {
    /// HTTP status an HTTP front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            IngressError::Unauthorized => 401,
            IngressError::InvalidUrl { .. } | IngressError::UnsupportedFormat(_) => 400,
            IngressError::DomainNotAllowed(_) => 403,
            IngressError::Task(TaskError::WaitTimeout { .. }) => 504,
            IngressError::Task(_) => 500,
        }
    }
}

pub type IngressResult<T> = std::result::Result<T, IngressError>;

/// One conversion request as seen by the front end.
#[derive(Debug, Clone, Default)]
pub struct IngressRequest {
    /// Request path, e.g. `/https://example.com/a.jpg` or `/example.com/a.jpg`.
    pub path: String,
    /// Explicit `format` query value.
    pub format: Option<String>,
    pub accept: Option<String>,
    pub api_key: Option<String>,
}

impl IngressRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngressOutcome {
    /// The artifact is ready under `location` (`/img/<key>.<ext>`).
    Converted {
        key: TaskKey,
        format: TargetFormat,
        location: String,
    },
    /// Conversion failed; send the client to the source.
    Fallback { original_url: String },
    /// The client accepts neither WebP nor AVIF.
    Passthrough { original_url: String },
}

/// Recovers the source URL from a request path.
///
/// `/https://x` and `https://x` are taken as they are; a bare `/host/path`
/// is assumed to be plain HTTP.
pub fn extract_url(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix('/') {
        if rest.starts_with("http://") || rest.starts_with("https://") {
            return Some(rest.to_string());
        }
        return Some(format!("http://{rest}"));
    }
    if path.starts_with("http://") || path.starts_with("https://") {
        return Some(path.to_string());
    }
    None
}

/// Checks that `source_url` is an absolute http(s) URL with a host.
pub fn validate_source_url(source_url: &str) -> IngressResult<Url> {
    let invalid = |reason: &str| IngressError::InvalidUrl {
        url: source_url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = Url::parse(source_url).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(invalid("missing host")),
    }
}

/// Exact or subdomain match against the whitelist; an empty whitelist allows
/// everything. `host` must already be stripped of any port.
pub fn is_domain_allowed(host: &str, whitelist: &[String]) -> bool {
    let allowed = whitelist
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .collect::<Vec<_>>();
    if allowed.is_empty() {
        return true;
    }
    let host = host.to_ascii_lowercase();
    allowed.into_iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// Explicit format first, then the `Accept` header. `Ok(None)` means no
/// supported format could be agreed on.
pub fn choose_format(
    requested: Option<&str>,
    accept: Option<&str>,
) -> IngressResult<Option<TargetFormat>> {
    match requested.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => Ok(Some(value.parse()?)),
        None => Ok(accept.and_then(TargetFormat::negotiate)),
    }
}

/// Entry point for conversion requests: validates, records the request in the
/// task table and blocks until a worker has finished with it.
#[derive(Debug, Clone)]
pub struct Gateway {
    store: SqliteTaskStore,
    waiter: CompletionWaiter,
    config: IngressSection,
}

impl Gateway {
    pub fn new(store: SqliteTaskStore, waiter: CompletionWaiter, config: IngressSection) -> Self {
        Self {
            store,
            waiter,
            config,
        }
    }

    fn authorize(&self, presented: Option<&str>) -> IngressResult<()> {
        if self.config.api_key.is_empty() {
            return Ok(());
        }
        match presented {
            Some(key) if key == self.config.api_key => Ok(()),
            _ => Err(IngressError::Unauthorized),
        }
    }

    pub async fn resolve(&self, request: &IngressRequest) -> IngressResult<IngressOutcome> {
        self.authorize(request.api_key.as_deref())?;

        let original_url =
            extract_url(&request.path).ok_or_else(|| IngressError::InvalidUrl {
                url: request.path.clone(),
                reason: "path does not contain a url".into(),
            })?;
        let parsed = validate_source_url(&original_url)?;
        let host = parsed.host_str().unwrap_or_default();
        if !is_domain_allowed(host, &self.config.domain_whitelist) {
            return Err(IngressError::DomainNotAllowed(host.to_string()));
        }

        let Some(format) = choose_format(request.format.as_deref(), request.accept.as_deref())?
        else {
            return Ok(IngressOutcome::Passthrough { original_url });
        };

        let source = original_url.clone();
        let outcome =
            run_blocking(&self.store, move |store| store.get_or_create(&source, format)).await?;
        let task = outcome.task;
        if outcome.created {
            info!(task_id = task.id, key = %task.key, %format, "queued conversion");
        }

        match self
            .waiter
            .wait_for_terminal(&task.key, self.config.wait_timeout())
            .await?
        {
            TerminalStatus::Succeeded => Ok(IngressOutcome::Converted {
                location: task.serve_path(),
                key: task.key,
                format,
            }),
            TerminalStatus::Failed => {
                warn!(task_id = task.id, key = %task.key, "conversion failed, falling back");
                Ok(IngressOutcome::Fallback { original_url })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_embedded_and_bare_urls() {
        assert_eq!(
            extract_url("/https://example.com/a.jpg").as_deref(),
            Some("https://example.com/a.jpg")
        );
        assert_eq!(
            extract_url("/http://example.com/a.jpg").as_deref(),
            Some("http://example.com/a.jpg")
        );
        assert_eq!(
            extract_url("https://example.com/a.jpg").as_deref(),
            Some("https://example.com/a.jpg")
        );
        assert_eq!(
            extract_url("/example.com/a.jpg").as_deref(),
            Some("http://example.com/a.jpg")
        );
        assert_eq!(extract_url("example.com/a.jpg"), None);
    }

    #[test]
    fn rejects_urls_without_host() {
        assert!(validate_source_url("http://").is_err());
        assert!(validate_source_url("").is_err());
        assert!(validate_source_url("ftp://example.com/a.jpg").is_err());
        assert!(validate_source_url("https://example.com/a.jpg").is_ok());
    }

    #[test]
    fn whitelist_matches_exact_and_subdomains() {
        let whitelist = vec!["example.com".to_string(), " ".to_string()];
        assert!(is_domain_allowed("example.com", &whitelist));
        assert!(is_domain_allowed("cdn.example.com", &whitelist));
        assert!(!is_domain_allowed("badexample.com", &whitelist));
        assert!(!is_domain_allowed("example.org", &whitelist));
        assert!(is_domain_allowed("anything.net", &[]));
    }

    #[test]
    fn port_is_ignored_by_whitelist() {
        let parsed = validate_source_url("http://cdn.example.com:8080/a.jpg").unwrap();
        assert!(is_domain_allowed(
            parsed.host_str().unwrap(),
            &["example.com".to_string()]
        ));
    }

    #[test]
    fn explicit_format_beats_accept_header() {
        assert_eq!(
            choose_format(Some("webp"), Some("image/avif,image/webp")).unwrap(),
            Some(TargetFormat::Webp)
        );
        assert_eq!(
            choose_format(None, Some("image/avif,image/webp,*/*")).unwrap(),
            Some(TargetFormat::Avif)
        );
        assert_eq!(choose_format(None, Some("image/png")).unwrap(), None);
        assert_eq!(choose_format(Some(""), None).unwrap(), None);
        assert!(matches!(
            choose_format(Some("png"), None),
            Err(IngressError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(IngressError::Unauthorized.status_code(), 401);
        assert_eq!(IngressError::DomainNotAllowed("x".into()).status_code(), 403);
        assert_eq!(
            IngressError::UnsupportedFormat(UnsupportedFormat("png".into())).status_code(),
            400
        );
    }
}
