//! Errors raised by the reference server.

use thiserror::Error;

/// Result type for reference server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors from table mutations and request handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// No table with this name exists.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A table with this name already exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// Insert of a key that is already present.
    #[error("duplicate key {key} in {table}")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
    },

    /// Update or delete of a key that is not present.
    #[error("unknown key {key} in {table}")]
    UnknownKey {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
    },

    /// A row lacks a primary key column.
    #[error("row for {table} is missing primary key column {column}")]
    MissingPrimaryKey {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A row was not a JSON object.
    #[error("row must be a JSON object")]
    InvalidRow,

    /// A required query parameter was absent.
    #[error("missing query parameter: {0}")]
    MissingParam(&'static str),

    /// The offset parameter could not be parsed.
    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    /// A log offset was requested without a handle.
    #[error("a handle is required with a log offset")]
    HandleRequired,
}

impl ServerError {
    /// HTTP status the error is reported with.
    pub fn status(&self) -> u16 {
        match self {
            Self::UnknownTable(_) => 404,
            Self::TableExists(_) | Self::DuplicateKey { .. } | Self::UnknownKey { .. } => 409,
            _ => 400,
        }
    }
}
