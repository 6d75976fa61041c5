//! Error types for Kadr Core

use thiserror::Error;

/// Result type alias for player operations
pub type Result<T> = std::result::Result<T, Error>;

/// Manifest load failures. These reject one attach attempt only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(String),

    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Manifest declares no playable levels")]
    Empty,

    #[error("Manifest unreachable: {0}")]
    Unreachable(String),
}

/// Network-layer failures for playlist, segment and index requests.
///
/// Clonable so results can travel through the engine's message queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Request timed out: {url}")]
    Timeout { url: String },

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn network(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        FetchError::Network {
            url: url.into(),
            message: err.to_string(),
        }
    }

    /// Status code when the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures reported by the media surface (decoder / render pipeline)
/// or by the audio graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported media: {0}")]
    Unsupported(String),

    #[error("Unrecoverable pipeline error: {0}")]
    Unrecoverable(String),
}

/// Player error types
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Unknown quality level: {0}")]
    UnknownLevel(usize),

    #[error("Player session has stopped")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resume storage error: {0}")]
    Storage(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Fetch(FetchError::Cancelled) => false,
            Error::Fetch(_) => true,
            Error::Sink(SinkError::Decode(_)) => true,
            Error::Storage(_) => true,
            _ => false,
        }
    }

    /// Returns the error code reported alongside notifications
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Manifest(ManifestError::NotFound(_)) => "MANIFEST_NOT_FOUND",
            Error::Manifest(ManifestError::Malformed(_)) => "MANIFEST_MALFORMED",
            Error::Manifest(ManifestError::Empty) => "MANIFEST_EMPTY",
            Error::Manifest(ManifestError::Unreachable(_)) => "MANIFEST_FETCH",
            Error::Fetch(FetchError::Timeout { .. }) => "TIMEOUT",
            Error::Fetch(FetchError::Cancelled) => "CANCELLED",
            Error::Fetch(_) => "NETWORK",
            Error::Sink(SinkError::Decode(_)) => "MEDIA_DECODE",
            Error::Sink(SinkError::Unsupported(_)) => "MEDIA_UNSUPPORTED",
            Error::Sink(SinkError::Unrecoverable(_)) => "MEDIA_FATAL",
            Error::UnknownLevel(_) => "UNKNOWN_LEVEL",
            Error::SessionClosed => "SESSION_CLOSED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Storage(_) => "STORAGE",
            Error::Url(_) => "INVALID_URL",
            Error::Json(_) => "JSON",
            Error::Io(_) => "IO",
        }
    }
}

impl From<FetchError> for ManifestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status { url, status: 404 | 410 } => ManifestError::NotFound(url),
            other => ManifestError::Unreachable(other.to_string()),
        }
    }
}
