//! Error types for token session operations.
//!
//! Two layers: [`TransportError`] is what a token adapter reports for a single
//! device call, [`SessionError`] is what the session manager reports to its
//! callers. Every session error is a distinct variant so callers can match on
//! it instead of parsing messages.

use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type for individual transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure of a single call on the token transport.
#[derive(Error, Debug, Clone, PartialEq, Eq, miette::Diagnostic)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    /// The device closed the stream or did not answer at all.
    #[error("unexpected end of stream")]
    Eof,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Eof,
            _ => TransportError::Io(error.to_string()),
        }
    }
}

/// Errors surfaced by the session manager and the signature provider.
#[derive(Error, Debug, Clone, PartialEq, Eq, miette::Diagnostic)]
pub enum SessionError {
    #[error("no TKey found")]
    #[diagnostic(help("Plug in your TKey and try again."))]
    DeviceNotFound,

    #[error("found {0} TKeys, cannot choose between them")]
    #[diagnostic(help("Remove all but one TKey and try again."))]
    AmbiguousDevice(usize),

    #[error("could not connect to a TKey on port {port}: {reason}")]
    ConnectFailed { port: String, reason: String },

    #[error("failed to acquire personalization secret: {0}")]
    SecretAcquisitionFailed(String),

    #[error("failed to load signer app: {0}")]
    AppLoadFailed(String),

    #[error("TKey is running an unexpected app")]
    #[diagnostic(help("Unplug the TKey and plug it in again; it might be running the wrong app."))]
    WrongApplication,

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("device operation failed: {0}")]
    DeviceOperationFailed(String),

    #[error("session is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SessionError {
    /// Actionable guidance for errors the user can fix at the device.
    #[must_use]
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            SessionError::DeviceNotFound => Some("Could not find any TKey plugged in."),
            SessionError::AmbiguousDevice(_) => Some("Cannot work with more than 1 TKey plugged in."),
            SessionError::WrongApplication => {
                Some("Please remove and plug in your TKey again, it might be running the wrong app.")
            }
            _ => None,
        }
    }

    /// Whether a cached session that produced this error should be replaced.
    #[must_use]
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectFailed { .. }
                | SessionError::WrongApplication
                | SessionError::DeviceOperationFailed(_)
        )
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(error: toml::de::Error) -> Self {
        SessionError::Configuration(error.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::Configuration(error.to_string())
    }
}
