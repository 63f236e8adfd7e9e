//! Error types for the client runtime.

use std::io;

use crate::status::Status;

/// Result type for client runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during client runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A Channel Access status condition.
    #[error("{}: {context}", .status.message())]
    Ca {
        /// The status value.
        status: Status,
        /// What was being attempted.
        context: String,
    },

    /// Channel priority above the supported maximum.
    #[error("channel priority {priority} above maximum {max}")]
    BadPriority {
        /// Requested priority.
        priority: u8,
        /// Highest supported priority.
        max: u8,
    },

    /// Channel name rejected (empty or over the protocol limit).
    #[error("invalid channel name: {0:?}")]
    BadChannelName(String),

    /// Frame was shorter than its header declared.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected byte count.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Inbound frame violated the protocol.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The context is shutting down.
    #[error("client context is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Wrap a status condition with context.
    pub fn ca(status: Status, context: impl Into<String>) -> Self {
        Self::Ca {
            status,
            context: context.into(),
        }
    }

    /// The status value, when this error carries one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Ca { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error means the channel was not connected.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Self::Ca {
                status: Status::DISCONNCHID | Status::DISCONN,
                ..
            }
        )
    }
}

/// Failure delivered to an IO callback.
///
/// Carries the server- or client-originated status, a context string,
/// and, when the failing operation had one, the data type and element
/// count of the request.
#[derive(Debug, Clone)]
pub struct CaException {
    /// Status describing the failure.
    pub status: Status,
    /// Context string ("host=... ctx=..." for server exceptions).
    pub context: String,
    /// Data type of the failed request, when applicable.
    pub data_type: Option<u16>,
    /// Element count of the failed request, when applicable.
    pub count: Option<u32>,
}

impl CaException {
    pub(crate) fn new(status: Status, context: impl Into<String>) -> Self {
        Self {
            status,
            context: context.into(),
            data_type: None,
            count: None,
        }
    }

    pub(crate) fn typed(
        status: Status,
        context: impl Into<String>,
        data_type: u16,
        count: u32,
    ) -> Self {
        Self {
            status,
            context: context.into(),
            data_type: Some(data_type),
            count: Some(count),
        }
    }
}

impl std::fmt::Display for CaException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status.message(), self.context)
    }
}
