//! Dispatch error taxonomy and its mapping onto HTTP status codes.

use http::StatusCode;
use thiserror::Error;

/// Boxed error returned by interceptors, listeners and other pluggable parts.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the dispatch core.
///
/// Interceptor and teardown faults are logged and swallowed by the pipeline,
/// so only the context-resolution and dispatch variants ever reach a client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no serving context mounted for {0}")]
    NoContext(String),

    #[error("failed to construct serving context {key}: {reason}")]
    ContextConstruction { key: String, reason: String },

    #[error("serving context {0} is no longer active")]
    ContextDestroyed(String),

    #[error("HTTP TRACE method is disabled")]
    TraceDisabled,

    #[error("interceptor {name} failed: {reason}")]
    Interceptor { name: String, reason: String },

    #[error("unknown interceptor: {0}")]
    UnknownInterceptor(String),

    #[error("failed to instantiate interceptor {name}: {reason}")]
    Instantiation { name: String, reason: String },

    #[error("teardown of {key} failed: {reason}")]
    Teardown { key: String, reason: String },

    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("invalid rules: {0}")]
    InvalidRules(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    pub fn construction(key: impl ToString, reason: impl ToString) -> Self {
        Self::ContextConstruction {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn interceptor(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Interceptor {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn instantiation(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Instantiation {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn teardown(key: impl ToString, reason: impl ToString) -> Self {
        Self::Teardown {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// An error that carries its own response status.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(StatusCode::NOT_FOUND, message)
    }

    /// Status the transport should answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoContext(_) => StatusCode::NOT_FOUND,
            Self::ContextConstruction { .. } => StatusCode::BAD_GATEWAY,
            Self::ContextDestroyed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::TraceDisabled => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidRules(_) => StatusCode::BAD_REQUEST,
            Self::Status { status, .. } => *status,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::FORBIDDEN
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type used across the dispatch core.
pub type DispatchResult<T = ()> = Result<T, DispatchError>;
