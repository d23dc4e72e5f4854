//! Error types for the shape client.

use shapesync_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Result type for shape client operations.
pub type ShapeResult<T> = Result<T, ShapeError>;

/// Errors that can occur while syncing a shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the request can be retried.
        retryable: bool,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body or reason.
        message: String,
        /// Request URL.
        url: String,
        /// Server-requested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// A successful response lacked protocol headers.
    #[error("response from {url} is missing headers: {}", headers.join(", "))]
    MissingHeaders {
        /// Request URL.
        url: String,
        /// Names of the missing headers.
        headers: Vec<String>,
    },

    /// The response body or headers could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stream's abort signal fired.
    #[error("shape stream aborted")]
    Aborted,

    /// Stream options were rejected before any request was made.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl ShapeError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the request may be retried with backoff.
    ///
    /// Rate limiting (429) and server errors (5xx) are retried; other client
    /// errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShapeError::Transport { retryable, .. } => *retryable,
            ShapeError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns the HTTP status, if this is an HTTP error.
    pub fn status(&self) -> Option<u16> {
        match self {
            ShapeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the server-requested retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ShapeError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
