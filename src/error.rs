//! Crate-wide error taxonomy
//!
//! Every failure the daemon or a sandbox helper reports carries one of a
//! small set of kinds so callers can classify errors that crossed the
//! control channel without matching on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error, preserved across process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// A request argument failed validation
    InvalidArgument,

    /// The operation is not legal in the current lifecycle state
    InvalidState,

    /// The addressed container, process, volume, or network does not exist
    NotFound,

    /// An id, hostname, or name is already taken
    Exists,

    /// The operation is not supported by this build or backend
    Unsupported,

    /// The operation was cancelled or interrupted mid-flight
    Interrupted,

    /// A required value or collection was empty
    Empty,

    /// Everything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::NotFound => "not found",
            ErrorKind::Exists => "already exists",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Empty => "empty",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{}", s)
    }
}

/// The daemon error type: a kind, a message, and an optional cause.
///
/// Wrapping an error (for example when a helper-side failure is re-reported
/// by the orchestrator) keeps the original kind so `is_kind` classification
/// still works at the outermost caller.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` with additional context, preserving its kind when it is
    /// already a classified error.
    pub fn wrap(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        let kind = (&cause as &(dyn std::error::Error))
            .downcast_ref::<Error>()
            .map(|e| e.kind)
            .unwrap_or(ErrorKind::Internal);
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exists, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
            cause: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: format!("serialization failed: {}", err),
            cause: Some(Box::new(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
