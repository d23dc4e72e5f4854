//! # Shapesync Client
//!
//! Syncs server-defined shapes into local, continuously updated collections.
//!
//! This crate provides:
//! - `ShapeStream`, a resumable long-poll reader of one shape's log
//! - `Shape`, the materialized rows of a stream
//! - `ShapeClient`, a cache that shares streams and shapes between consumers
//!   and dehydrates them for resuming elsewhere
//! - `ReduceStream`, which folds a log into a single value
//! - `match_stream` / `match_by` for confirming local writes
//! - HTTP client and resume store abstractions
//!
//! ## Architecture
//!
//! ```text
//! ShapeClient ──► ShapeStream ──► (ReduceStream) ──► Shape ──► subscribers
//!                      │
//!                      └──► match_stream
//! ```
//!
//! Nothing is requested until a stream gets its first subscriber (or
//! [`ShapeStream::start`] is awaited). With `abort_when_idle` on, the last
//! unsubscribe aborts the stream and the cache evicts it on the next lookup.
//!
//! ## Key Invariants
//!
//! - Offsets accepted by a stream never move backwards within a handle
//! - Subscribers see batches whole and in request order
//! - A must-refetch clears materialized rows before any new row is applied
//! - `is_loading` never becomes true again after the first up-to-date
//! - Equal option hashes share one stream and one shape

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod http;
mod matcher;
mod reduce;
mod resume;
mod shape;
mod signal;
mod source;
mod stream;

pub use cache::{DehydratedShape, DehydratedState, ShapeClient};
pub use config::{
    ErrorHandler, LogMode, OptionsHash, Replica, RetryConfig, RetryOverride, ShapeStreamOptions,
    MAX_RETRY_AFTER,
};
pub use error::{ShapeError, ShapeResult};
pub use http::{HttpClient, HttpResponse, LoopbackClient, LoopbackServer, ReqwestClient};
pub use matcher::{match_by, match_stream, match_txid};
pub use reduce::{ReduceFn, ReduceStream, DEFAULT_REDUCE_KEY};
pub use resume::{MemoryResumeStore, ResumeState, ResumeStore};
pub use shape::{Shape, ShapeCallback, ShapeData, ShapeUpdate};
pub use signal::AbortSignal;
pub use source::{ErrorCallback, MessagesCallback, ShapeSource, Subscriber, Subscription};
pub use stream::{RunState, ShapeStream};

pub use shapesync_protocol as protocol;
