//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding shape log data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The offset string is neither a sentinel nor `<tx>_<op>`.
    #[error("invalid offset: {0:?}")]
    InvalidOffset(String),

    /// The response body is not valid JSON.
    #[error("malformed JSON: {message}")]
    MalformedJson {
        /// Description of the parse failure.
        message: String,
    },

    /// A log entry does not have the structure of a message.
    #[error("invalid message structure: {message}")]
    InvalidMessage {
        /// Description of the structural error.
        message: String,
    },

    /// The column schema header could not be decoded.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the schema error.
        message: String,
    },

    /// A column declared `NOT NULL` carried a null value.
    #[error("column {column} is not nullable")]
    NullInNonNullableColumn {
        /// Column name.
        column: String,
    },

    /// A value parser rejected a raw column value.
    #[error("failed to parse column {column} as {type_name}: {message}")]
    ValueParse {
        /// Column name.
        column: String,
        /// Column type name as reported by the server.
        type_name: String,
        /// Parser message.
        message: String,
    },

    /// A Postgres array literal is malformed.
    #[error("invalid array literal: {message}")]
    InvalidArray {
        /// Description of the error.
        message: String,
    },
}

impl ProtocolError {
    /// Creates an invalid message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Creates an invalid array error.
    pub fn invalid_array(message: impl Into<String>) -> Self {
        Self::InvalidArray {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedJson {
            message: err.to_string(),
        }
    }
}
