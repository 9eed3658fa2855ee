//! Error types for the cache client core

use thiserror::Error;
use tonic::{Code, Status};

/// Result type alias for the cache client core
pub type Result<T> = std::result::Result<T, ClientError>;

/// Coarse classification of a failure, used by logs and by callers that want
/// to tell "the server rejected me" apart from "I gave up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport hiccup that may succeed when replayed (internal, unavailable, ...).
    Transient,
    /// The service rejected the request for a reason a replay will not fix.
    Permanent,
    /// The client stopped on its own: deadline budget spent or cancelled.
    ClientLocal,
    /// Broken invariant or misconfiguration inside the client itself.
    Internal,
}

/// Main error type for the cache client core
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Failure status reported by the service or the transport
    #[error("service error: {0}")]
    Service(Status),

    /// The call's overall deadline elapsed before a result arrived.
    /// `last_status` is the failure of the previous attempt, if there was one.
    #[error("deadline exceeded after {attempts} attempt(s){}", last_failure(.last_status))]
    DeadlineExceeded {
        attempts: u32,
        last_status: Option<Status>,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation inside the client (double release, ...)
    #[error("internal client error: {0}")]
    Internal(String),

    /// A value was read through the accessor for a different variant
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Invalid construction-time configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn deadline_exceeded(attempts: u32, last_status: Option<Status>) -> Self {
        Self::DeadlineExceeded {
            attempts,
            last_status,
        }
    }

    /// The last service status known for this failure, if any reached the client.
    ///
    /// For a deadline cut-off this is the status of the attempt before the one
    /// that ran out of time.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Service(status) => Some(status),
            Self::DeadlineExceeded { last_status, .. } => last_status.as_ref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Service(status) => classify(status.code()),
            Self::DeadlineExceeded { .. } | Self::Cancelled => ErrorKind::ClientLocal,
            Self::Internal(_) | Self::Config(_) | Self::TypeMismatch { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

/// Map a transport code onto the failure taxonomy.
///
/// `DeadlineExceeded` and `Cancelled` coming back from the transport are the
/// client's own budget running out, so they land in `ClientLocal` rather than
/// `Transient`.
pub fn classify(code: Code) -> ErrorKind {
    match code {
        Code::Internal
        | Code::Unavailable
        | Code::Unknown
        | Code::ResourceExhausted
        | Code::Aborted => ErrorKind::Transient,
        Code::DeadlineExceeded | Code::Cancelled => ErrorKind::ClientLocal,
        Code::Ok
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Unimplemented
        | Code::DataLoss
        | Code::Unauthenticated => ErrorKind::Permanent,
    }
}

fn last_failure(status: &Option<Status>) -> String {
    match status {
        Some(status) => format!(" (last failure: {:?}: {})", status.code(), status.message()),
        None => String::new(),
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        Self::Service(status)
    }
}

impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Service(status) => status,
            ClientError::DeadlineExceeded { .. } => Status::deadline_exceeded(err.to_string()),
            ClientError::Cancelled => Status::cancelled(err.to_string()),
            ClientError::TypeMismatch { .. } => Status::invalid_argument(err.to_string()),
            ClientError::Internal(_) | ClientError::Config(_) => Status::internal(err.to_string()),
        }
    }
}
