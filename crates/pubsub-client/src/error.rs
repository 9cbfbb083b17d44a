//! Crate-wide error type.

use crate::status::StatusCategory;

/// Refinement of [`Error::Server`] by HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    BadRequest,
    AccessDenied,
    NotFound,
    RateLimited,
    Other,
}

impl ServerErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 | 403 => Self::AccessDenied,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            _ => Self::Other,
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing or inconsistent input, detected before any network I/O.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {message}")]
    Transport { message: String, timed_out: bool },

    /// The service answered with HTTP status >= 400.
    #[error("server error {status}: {message}")]
    Server {
        status: u16,
        kind: ServerErrorKind,
        message: String,
        body: Option<serde_json::Value>,
    },

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("token error: {0}")]
    Token(String),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn decoding(msg: impl Into<String>) -> Self {
        Error::Decoding(msg.into())
    }

    /// Status category surfaced to listeners for this error.
    pub fn category(&self) -> StatusCategory {
        match self {
            Error::Validation(_) => StatusCategory::BadRequest,
            Error::Transport { timed_out: true, .. } => StatusCategory::Timeout,
            Error::Transport { .. } => StatusCategory::NetworkIssues,
            Error::Server { kind, .. } => match kind {
                ServerErrorKind::BadRequest => StatusCategory::BadRequest,
                ServerErrorKind::AccessDenied => StatusCategory::AccessDenied,
                _ => StatusCategory::Unknown,
            },
            Error::Cancelled => StatusCategory::Cancelled,
            Error::Crypto(_) => StatusCategory::DecryptionError,
            Error::Decoding(_) | Error::Token(_) => StatusCategory::Unknown,
        }
    }

    /// HTTP status carried by a server error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the subscribe loop may retry after this failure.
    ///
    /// Transport failures, timeouts, 5xx and 429 are retriable; validation,
    /// decoding and other 4xx answers are not.
    pub(crate) fn is_retriable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn server(status: u16) -> Error {
        Error::Server {
            status,
            kind: ServerErrorKind::from_status(status),
            message: String::new(),
            body: None,
        }
    }

    #[test]
    fn server_kind_from_status() {
        assert_eq!(ServerErrorKind::from_status(400), ServerErrorKind::BadRequest);
        assert_eq!(ServerErrorKind::from_status(403), ServerErrorKind::AccessDenied);
        assert_eq!(ServerErrorKind::from_status(404), ServerErrorKind::NotFound);
        assert_eq!(ServerErrorKind::from_status(429), ServerErrorKind::RateLimited);
        assert_eq!(ServerErrorKind::from_status(502), ServerErrorKind::Other);
    }

    #[test]
    fn categories() {
        assert_eq!(server(403).category(), StatusCategory::AccessDenied);
        assert_eq!(server(400).category(), StatusCategory::BadRequest);
        assert_eq!(server(500).category(), StatusCategory::Unknown);
        assert_eq!(Error::Cancelled.category(), StatusCategory::Cancelled);
        assert_eq!(
            Error::Transport {
                message: "reset".into(),
                timed_out: false
            }
            .category(),
            StatusCategory::NetworkIssues
        );
        assert_eq!(
            Error::Transport {
                message: "deadline".into(),
                timed_out: true
            }
            .category(),
            StatusCategory::Timeout
        );
    }

    #[test]
    fn retriable_errors() {
        assert!(server(500).is_retriable());
        assert!(server(503).is_retriable());
        assert!(server(429).is_retriable());
        assert!(!server(403).is_retriable());
        assert!(!server(400).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
        assert!(!Error::decoding("bad json").is_retriable());
    }
}
