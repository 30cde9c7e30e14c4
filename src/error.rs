use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Fatal errors: the only ones that abort a run.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid seed address {address}: {source}")]
    InvalidSeed {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("seed page {address} could not be rendered: {source}")]
    SeedUnavailable {
        address: String,
        #[source]
        source: RenderError,
    },

    #[error("seed page {0} was declined before rendering")]
    SeedDeclined(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("http client could not be built: {0}")]
    Client(String),

    #[error("failed to write run report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Errors reported by a rendering collaborator.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("page not found (HTTP {0})")]
    NotFound(u16),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("render timed out")]
    Timeout,

    #[error("render cancelled")]
    Cancelled,

    #[error("unknown session handle {0}")]
    UnknownSession(u64),

    #[error("not an HTML document ({0})")]
    NotHtml(String),
}

impl From<reqwest::Error> for RenderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RenderError::Timeout
        } else {
            RenderError::Transport(err.to_string())
        }
    }
}

/// Errors from a single resource fetch attempt.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("not found (HTTP {0})")]
    NotFound(u16),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("content could not be decoded: {0}")]
    Decode(String),

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("could not persist file: {0}")]
    Io(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NotFound(_) => FailureKind::NotFound,
            FetchError::Status(_) | FetchError::Transport(_) => FailureKind::Transport,
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::Decode(_) => FailureKind::Decode,
            FetchError::Cancelled => FailureKind::Cancelled,
            FetchError::Io(_) => FailureKind::Io,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transport | FailureKind::Timeout)
    }

    pub fn detail(&self) -> FailureDetail {
        let kind = self.kind();
        FailureDetail {
            kind,
            severity: kind.severity(),
            message: self.to_string(),
        }
    }
}

impl From<RenderError> for FetchError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::NotFound(code) => FetchError::NotFound(code),
            RenderError::Status(code) => FetchError::Status(code),
            RenderError::Transport(msg) => FetchError::Transport(msg),
            RenderError::Timeout => FetchError::Timeout(std::time::Duration::ZERO),
            RenderError::Cancelled => FetchError::Cancelled,
            RenderError::UnknownSession(id) => {
                FetchError::Transport(format!("unknown session handle {}", id))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    NotFound,
    Transport,
    Timeout,
    Decode,
    LimitReached,
    Cancelled,
    Io,
}

impl FailureKind {
    pub fn severity(self) -> Severity {
        match self {
            FailureKind::NotFound | FailureKind::LimitReached | FailureKind::Cancelled => {
                Severity::Info
            }
            FailureKind::Transport | FailureKind::Timeout | FailureKind::Decode => {
                Severity::Warning
            }
            FailureKind::Io => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
}

impl FailureDetail {
    pub fn cancelled() -> Self {
        FetchError::Cancelled.detail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(FetchError::NotFound(404).kind(), FailureKind::NotFound);
        assert_eq!(FetchError::NotFound(404).detail().severity, Severity::Info);
        assert_eq!(FetchError::Status(503).kind(), FailureKind::Transport);
        assert_eq!(FetchError::Decode("x".into()).detail().severity, Severity::Warning);
        assert_eq!(FetchError::Io("disk".into()).detail().severity, Severity::Error);
    }

    #[test]
    fn test_retryable() {
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(FetchError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(FetchError::Status(500).is_retryable());
        assert!(!FetchError::NotFound(404).is_retryable());
        assert!(!FetchError::Decode("bad".into()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
