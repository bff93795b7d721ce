use thiserror::Error;

/// Errors that can occur while synchronizing documents.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Lifecycle store error: {0}")]
    Store(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Publishing {path} failed after {attempts} attempt(s): {last_error}")]
    TerminalPublish {
        path: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by a [`crate::RemoteStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection, DNS, TLS or timeout failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered with a non-success status.
    #[error("remote returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl RemoteError {
    /// HTTP status, when the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connectivity, rate limiting, conflicts and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Api { status, code, .. } => {
                *status == 409
                    || *status == 429
                    || *status >= 500
                    || code == "rate_limited"
                    || code == "conflict_error"
            }
            RemoteError::Decode(_) => false,
        }
    }

    /// Authentication and addressing failures never recover by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403) | Some(404))
    }
}
