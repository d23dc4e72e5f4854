//! # Shapesync Testkit
//!
//! Test utilities for Shapesync.
//!
//! This crate provides:
//! - `ShapeLogServer`, an in-memory server for the shape log protocol
//! - `ScriptedSource`, a shape source fed by the test
//! - Fixtures for tables, servers and stream options
//! - Property-based generators for change logs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shapesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_todos() {
//!     let server = todos_server();
//!     server.insert(TODOS, todo("1", "write tests")).unwrap();
//!
//!     let stream = ShapeStream::new(stream_options(&server, TODOS).with_subscribe(false)).unwrap();
//!     let shape = Shape::from_stream(&stream);
//!     stream.start().await.unwrap();
//!     assert_eq!(shape.current_rows().len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

mod config;
mod error;
mod server;
mod source;
mod table;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::{RecordedRequest, ScriptedSource, ServerConfig, ShapeLogServer, TableDef};
}

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{RecordedRequest, ShapeLogServer};
pub use source::ScriptedSource;
pub use table::{row_key, LogEntry, TableDef};
