//! Error types for the relay core.

use std::io;

use thiserror::Error;

use crate::table::BackendId;

/// A protocol module rejected a fully assembled frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    /// Create a new protocol error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message supplied by the protocol module.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised while driving a session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The protocol module rejected input.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Opening an outbound connection failed.
    #[error("failed to open backend connection to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A socket-level error was reported by the reactor.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The connector refused to provide a remote endpoint.
    #[error("no remote endpoint available")]
    NoEndpoint,

    /// The backend table has no free slot.
    #[error("backend table full: {capacity} live backends")]
    TableFull { capacity: usize },

    /// The protocol module targeted a backend id that is not live.
    #[error("unknown backend id {0}")]
    UnknownBackend(BackendId),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "protocol_error",
            RelayError::Connect { .. } => "connect_failed",
            RelayError::Io(_) => "io_error",
            RelayError::NoEndpoint => "no_endpoint",
            RelayError::TableFull { .. } => "table_full",
            RelayError::UnknownBackend(_) => "unknown_backend",
        }
    }

    /// Returns true if the error only loses the current message and the
    /// session may keep running.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::NoEndpoint | RelayError::TableFull { .. })
    }
}
