//! Error taxonomy for the pipeline core
//!
//! Every operation of the engine returns [`Result`]. The boundary layer maps
//! [`ErrorKind`] to whatever its transport needs; the core never does.

use thiserror::Error;

/// Result type alias for OBSDP operations
pub type Result<T> = std::result::Result<T, ObsdpError>;

/// Coarse classification of an [`ObsdpError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    AlreadyRunning,
    InvalidTransition,
    Upstream,
}

impl ErrorKind {
    /// Stable reason code reported to callers
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Upstream => "upstream",
        }
    }

    /// Whether the request was rejected before any state was touched
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::InvalidArgument | ErrorKind::AlreadyRunning
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Main error type for the pipeline core
#[derive(Error, Debug)]
pub enum ObsdpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Upstream failure: {0:#}")]
    Upstream(#[from] anyhow::Error),
}

impl ObsdpError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ObsdpError::NotFound(what.into())
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        ObsdpError::InvalidArgument(what.into())
    }

    pub fn already_running(what: impl Into<String>) -> Self {
        ObsdpError::AlreadyRunning(what.into())
    }

    pub fn invalid_transition(what: impl Into<String>) -> Self {
        ObsdpError::InvalidTransition(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ObsdpError::NotFound(_) => ErrorKind::NotFound,
            ObsdpError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ObsdpError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ObsdpError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            ObsdpError::Upstream(_) => ErrorKind::Upstream,
        }
    }

    /// Stable reason code, see [`ErrorKind::code`]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Recover a typed error that travelled through `anyhow`, otherwise wrap it
    pub fn from_collaborator(err: anyhow::Error) -> Self {
        match err.downcast::<ObsdpError>() {
            Ok(typed) => typed,
            Err(other) => ObsdpError::Upstream(other),
        }
    }
}

impl From<std::io::Error> for ObsdpError {
    fn from(err: std::io::Error) -> Self {
        ObsdpError::Upstream(err.into())
    }
}

impl From<serde_json::Error> for ObsdpError {
    fn from(err: serde_json::Error) -> Self {
        ObsdpError::Upstream(err.into())
    }
}
