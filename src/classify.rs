//! Failure classification for download attempts
//!
//! A failed attempt leaves its combined stdout/stderr in the task's log file.
//! A [`FailureClassifier`] turns that log into a [`TaskError`] and decides
//! whether the proxy used for the attempt is to blame.

use crate::error::TaskError;
use regex::{Regex, RegexBuilder};
use std::path::Path;
use tracing::warn;

/// Trait for log-based failure classification
///
/// Implementations must be cheap to call; the task runner invokes them once per
/// failed attempt and once per returned proxy.
pub trait FailureClassifier: Send + Sync {
    /// Classify a failed attempt from its log text
    fn classify(&self, log: &str) -> TaskError;

    /// Whether the log shows the proxy broke the attempt
    fn blames_proxy(&self, log: &str) -> bool;
}

/// A log pattern and the error it indicates
#[derive(Debug, Clone)]
pub struct Signature {
    /// Case-insensitive regular expression matched against the whole log
    pub pattern: String,
    /// Error reported when the pattern matches
    pub error: TaskError,
}

impl Signature {
    /// Create a signature
    pub fn new(pattern: impl Into<String>, error: TaskError) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }
}

/// Classifier driven by an ordered list of regex signatures
///
/// The first matching signature wins; logs that match nothing are
/// [`TaskError::Unknown`]. A proxy is blamed when a single log line mentions
/// `ERROR` and matches one of the proxy patterns.
pub struct SignatureClassifier {
    signatures: Vec<(Regex, TaskError)>,
    proxy_patterns: Vec<Regex>,
}

impl SignatureClassifier {
    /// Build a classifier; invalid patterns are logged and skipped
    pub fn new(signatures: Vec<Signature>, proxy_patterns: Vec<String>) -> Self {
        let signatures = signatures
            .into_iter()
            .filter_map(|sig| compile(&sig.pattern).map(|re| (re, sig.error)))
            .collect();
        let proxy_patterns = proxy_patterns.iter().filter_map(|p| compile(p)).collect();

        Self {
            signatures,
            proxy_patterns,
        }
    }
}

impl Default for SignatureClassifier {
    fn default() -> Self {
        Self::new(
            vec![
                Signature::new(
                    r"video (is )?(not available|unavailable)",
                    TaskError::VideoNotAvailable,
                ),
                Signature::new(
                    r"forcibly closed by the remote host",
                    TaskError::ConnectionForciblyClosed,
                ),
            ],
            vec![r"forcibly closed by the remote host".to_string()],
        )
    }
}

impl FailureClassifier for SignatureClassifier {
    fn classify(&self, log: &str) -> TaskError {
        self.signatures
            .iter()
            .find(|(re, _)| re.is_match(log))
            .map(|(_, error)| *error)
            .unwrap_or(TaskError::Unknown)
    }

    fn blames_proxy(&self, log: &str) -> bool {
        log.lines().any(|line| {
            line.to_ascii_lowercase().contains("error")
                && self.proxy_patterns.iter().any(|re| re.is_match(line))
        })
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1024 * 1024)
        .build()
        .map_err(|e| {
            warn!(pattern, error = %e, "Invalid failure signature pattern");
        })
        .ok()
}

/// Read a log file for classification; a missing or unreadable log reads as empty
pub(crate) async fn read_log(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to read task log");
            }
            String::new()
        }
    }
}
