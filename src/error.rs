//! Error taxonomy.
//!
//! Each pipeline layer has its own error type; all of them collapse into an
//! [`ErrorRecord`] at the boundary, which names exactly one [`ErrorKind`].
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure kinds a connector can report. Never merged into one generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, authentication, timeout.
    Connection,
    /// Introspection or execution denied.
    Permission,
    /// The backend rejected the query text.
    Syntax,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connection => write!(f, "Connection Error"),
            FailureKind::Permission => write!(f, "Permission Error"),
            FailureKind::Syntax => write!(f, "Syntax Error"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ConnectorError {
    pub kind: FailureKind,
    pub message: String,
}

impl ConnectorError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Connection,
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permission,
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Syntax,
            message: message.into(),
        }
    }
}

/// Errors from the language-model backend.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model rate limited")]
    RateLimited,

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("model response could not be decoded: {0}")]
    Decode(String),
}

impl ModelError {
    /// Whether a repeated call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Transport(_) | ModelError::RateLimited | ModelError::Timeout(_) => true,
            ModelError::Api { status, .. } => *status >= 500 || *status == 408,
            ModelError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model returned no parseable query")]
    EmptyResponse,

    #[error("model returned {count} candidate statements")]
    AmbiguousCandidate { count: usize },
}

/// A candidate matched the destructive-operation deny list.
#[derive(Debug, Clone, Error)]
#[error("candidate rejected: {reason}")]
pub struct ValidationRejected {
    pub candidate: String,
    pub reason: String,
}

/// Execution of a validated candidate failed.
#[derive(Debug, Clone, Error)]
#[error("{kind} while executing candidate: {backend_message}")]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub candidate: String,
    pub backend_message: String,
}

/// Boundary error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    PermissionError,
    SyntaxError,
    ModelError,
    EmptyResponseError,
    AmbiguousCandidateError,
    ValidationRejected,
    ConfigurationError,
}

impl ErrorKind {
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => {
                "Check that the backend is reachable and that the configured credentials are valid."
            }
            ErrorKind::PermissionError => {
                "Grant the configured account read access to the objects involved, or use a different profile."
            }
            ErrorKind::SyntaxError => {
                "Rephrase the request more precisely, or inspect and correct the returned query."
            }
            ErrorKind::ModelError => {
                "Check the language model configuration (endpoint, API key, quota) and try again later."
            }
            ErrorKind::EmptyResponseError => {
                "Rephrase the request; mention the collections or fields it concerns."
            }
            ErrorKind::AmbiguousCandidateError => {
                "Split the request into separate requests that each ask for one result."
            }
            ErrorKind::ValidationRejected => {
                "The generated query modifies or destroys data. Review it, or enable advisory safety mode if this is intended."
            }
            ErrorKind::ConfigurationError => {
                "Check the backend, dialect family and profile name against the configuration."
            }
        }
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Connection => ErrorKind::ConnectionError,
            FailureKind::Permission => ErrorKind::PermissionError,
            FailureKind::Syntax => ErrorKind::SyntaxError,
        }
    }
}

/// Structured error returned to callers.
///
/// `message` is always authored by this crate; raw backend text stays in
/// the logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    /// Schema acquisition failed.
    pub fn from_schema_failure(err: &ConnectorError) -> Self {
        let message = match err.kind {
            FailureKind::Connection => "could not reach the backend to read its schema",
            FailureKind::Permission => "the backend denied schema introspection",
            FailureKind::Syntax => "the backend rejected the schema introspection query",
        };
        Self::new(err.kind.into(), message)
    }

    pub fn from_synthesis(err: &SynthesisError) -> Self {
        match err {
            SynthesisError::Model(_) => Self::new(
                ErrorKind::ModelError,
                "the language model could not be reached after retrying",
            ),
            SynthesisError::EmptyResponse => Self::new(
                ErrorKind::EmptyResponseError,
                "the language model did not return a usable query",
            ),
            SynthesisError::AmbiguousCandidate { count } => Self::new(
                ErrorKind::AmbiguousCandidateError,
                format!("the language model returned {count} candidate queries instead of one"),
            ),
        }
    }

    pub fn from_rejection(err: &ValidationRejected) -> Self {
        Self::new(
            ErrorKind::ValidationRejected,
            format!("the generated query was not executed: {}", err.reason),
        )
    }

    pub fn from_execution(err: &ExecutionError, retries: u32) -> Self {
        let message = match err.kind {
            FailureKind::Connection => "lost contact with the backend while executing the query".to_string(),
            FailureKind::Permission => "the backend denied execution of the query".to_string(),
            FailureKind::Syntax if retries > 0 => format!(
                "the backend rejected the generated query after {retries} corrected attempt(s)"
            ),
            FailureKind::Syntax => "the backend rejected the generated query".to_string(),
        };
        Self::new(err.kind.into(), message)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
