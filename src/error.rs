//! Error types for the chat pipeline
//!
//! Failures coming back from the endpoint are classified rather than thrown:
//! [`Error::Api`] carries an [`ErrorKind`], the HTTP status and whether the
//! same request may succeed later. Callers pattern-match on [`Error::kind`].

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP 401 or any other non-429 4xx. Terminal.
    Auth,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    Server,
    /// Network failure or per-attempt timeout.
    Transport,
    /// Any other non-2xx status, such as an unfollowed redirect. Terminal.
    Unexpected,
}

impl ErrorKind {
    /// Classify an HTTP status code. Returns `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(ErrorKind::RateLimited),
            400..=499 => Some(ErrorKind::Auth),
            500..=599 => Some(ErrorKind::Server),
            _ => Some(ErrorKind::Unexpected),
        }
    }

    /// Whether the retry loop may attempt the request again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Server)
    }
}

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Non-2xx response from the endpoint
    #[error("API error {status} ({kind:?}): {message}")]
    Api {
        kind: ErrorKind,
        status: u16,
        retryable: bool,
        message: String,
    },

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Cache backing store failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Per-attempt timeout elapsed and the request was cancelled
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Build an API error from a non-2xx status, classifying it.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = ErrorKind::from_status(status).unwrap_or(ErrorKind::Unexpected);
        Error::Api {
            kind,
            status,
            retryable: kind.is_retryable(),
            message: message.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Classification for callers; `None` for local errors (config, JSON, cache...).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Api { kind, .. } => Some(*kind),
            Error::Http(_) | Error::Timeout => Some(ErrorKind::Transport),
            _ => None,
        }
    }

    /// HTTP status of an API error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the same request may succeed if attempted again later.
    ///
    /// Transport failures report `true` here even though the retry loop does
    /// not re-attempt them itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { retryable, .. } => *retryable,
            Error::Http(_) | Error::Timeout => true,
            _ => false,
        }
    }
}
