//! Column schema reported by the server alongside a shape.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Type information for a single column.
///
/// Type-specific modifiers (`max_length`, `precision`, `scale`, ...) are kept
/// in `modifiers` and handed to value parsers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Postgres type name, e.g. `int4` or `timestamptz`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Array dimensions; absent for scalar columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<u32>,
    /// True when the column has a `NOT NULL` constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_null: Option<bool>,
    /// Remaining type modifiers.
    #[serde(flatten)]
    pub modifiers: BTreeMap<String, Value>,
}

impl ColumnInfo {
    /// Creates a nullable scalar column of the given type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            dims: None,
            not_null: None,
            modifiers: BTreeMap::new(),
        }
    }

    /// Marks the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.not_null = Some(true);
        self
    }

    /// Makes the column an array with the given number of dimensions.
    pub fn with_dims(mut self, dims: u32) -> Self {
        self.dims = Some(dims);
        self
    }

    /// Returns true if nulls are allowed.
    pub fn is_nullable(&self) -> bool {
        !self.not_null.unwrap_or(false)
    }

    /// Returns true if the column holds an array.
    pub fn is_array(&self) -> bool {
        self.dims.is_some_and(|d| d > 0)
    }
}

/// Column name to type information.
pub type Schema = BTreeMap<String, ColumnInfo>;

/// Decodes the JSON schema header value.
pub fn parse_schema(raw: &str) -> ProtocolResult<Schema> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidSchema {
        message: e.to_string(),
    })
}
