//! # Shapesync Protocol
//!
//! Wire types and decoders for the shape log protocol.
//!
//! This crate provides:
//! - `Offset` and `ShapeHandle` log cursors
//! - Change and control messages
//! - Column schema decoding
//! - Pluggable value parsing, including Postgres array literals
//! - Header and query parameter names
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod constants;
mod error;
mod message;
mod offset;
mod parser;
mod schema;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    encode_messages, parse_messages, ChangeMessage, Control, ControlMessage, Message, Operation,
    Row,
};
pub use offset::{Offset, ShapeHandle};
pub use parser::{ParseFn, ValueParser};
pub use schema::{parse_schema, ColumnInfo, Schema};
