//! Shared streams and shapes, plus dehydration for handing state across
//! process boundaries.

use crate::config::{OptionsHash, ShapeStreamOptions};
use crate::error::ShapeResult;
use crate::shape::{Shape, ShapeData};
use crate::source::ShapeSource;
use crate::stream::ShapeStream;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shapesync_protocol::{Offset, Row, ShapeHandle};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// A shape captured after its first sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedShape {
    /// Rows as `(key, row)` pairs in shape order.
    pub rows: Vec<(String, Row)>,
    /// When the shape last became up to date.
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Offset the rows correspond to.
    pub offset: Offset,
    /// Handle the offset belongs to.
    #[serde(default)]
    pub handle: Option<ShapeHandle>,
}

impl DehydratedShape {
    /// The rows keyed by primary key.
    pub fn data(&self) -> ShapeData {
        self.rows.iter().cloned().collect()
    }
}

/// All dehydrated shapes of a client, keyed by options hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Captured shapes.
    #[serde(default)]
    pub shapes: BTreeMap<String, DehydratedShape>,
}

impl DehydratedState {
    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// Deduplicates streams and shapes across consumers.
///
/// Requests for shapes with the same [`OptionsHash`] share one
/// [`ShapeStream`] and one [`Shape`] for as long as the stream is not
/// aborted. Aborted entries are evicted on the next lookup.
///
/// One client serves one context; create separate clients when independent
/// caches are needed (for example one per rendered request).
#[derive(Default)]
pub struct ShapeClient {
    streams: Mutex<HashMap<OptionsHash, ShapeStream>>,
    shapes: Mutex<HashMap<u64, Shape>>,
    dehydrated: Mutex<BTreeMap<String, DehydratedShape>>,
}

impl ShapeClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client seeded with dehydrated state.
    pub fn with_state(state: DehydratedState) -> Self {
        let client = Self::new();
        client.hydrate_from_state(state);
        client
    }

    /// Returns the stream for `options`, creating it on a miss.
    pub fn get_shape_stream(&self, options: ShapeStreamOptions) -> ShapeResult<ShapeStream> {
        let hash = options.options_hash();
        self.get_shape_stream_with_hash(options, hash)
    }

    /// Returns the stream cached under `hash`, creating it from `options` on a
    /// miss.
    ///
    /// A new stream resumes from dehydrated state stored under the same hash
    /// unless `options` already carry a position.
    pub fn get_shape_stream_with_hash(
        &self,
        mut options: ShapeStreamOptions,
        hash: OptionsHash,
    ) -> ShapeResult<ShapeStream> {
        if let Some(stream) = self.live_stream(&hash) {
            return Ok(stream);
        }

        if options.offset.is_none() && options.handle.is_none() {
            if let Some(saved) = self.dehydrated.lock().get(hash.as_str()) {
                if let Some(handle) = &saved.handle {
                    debug!("Seeding stream {} from dehydrated {} at {}", hash, handle, saved.offset);
                    options = options.with_offset(saved.offset).with_handle(handle.clone());
                }
            }
        }

        let stream = ShapeStream::with_hash(options, hash.clone())?;
        let mut streams = self.streams.lock();
        let cached = streams.entry(hash).or_insert_with(|| stream.clone());
        Ok(cached.clone())
    }

    fn live_stream(&self, hash: &OptionsHash) -> Option<ShapeStream> {
        let mut streams = self.streams.lock();
        let stream = streams.get(hash)?;
        if !stream.signal().is_aborted() {
            return Some(stream.clone());
        }

        debug!("Evicting aborted stream {}", hash);
        let evicted = streams.remove(hash)?;
        drop(streams);
        self.shapes.lock().remove(&evicted.id());
        None
    }

    /// Returns the shape over `stream`, creating it on a miss.
    ///
    /// A new shape is seeded with dehydrated rows stored under the stream's
    /// options hash.
    pub fn get_shape(&self, stream: &ShapeStream) -> Shape {
        let mut shapes = self.shapes.lock();
        if let Some(shape) = shapes.get(&stream.id()) {
            if !shape.is_attached() && !stream.signal().is_aborted() {
                shape.reattach();
            }
            return shape.clone();
        }

        let shape = Shape::from_stream(stream);
        if let Some(saved) = self.dehydrated.lock().get(stream.options_hash().as_str()) {
            shape.initialize_with_ssr_data(saved.data(), saved.last_synced_at);
        }
        shapes.insert(stream.id(), shape.clone());
        shape
    }

    /// Gets the stream and shape for `options` and waits for the first sync.
    pub async fn preload_shape(&self, options: ShapeStreamOptions) -> ShapeResult<Shape> {
        let stream = self.get_shape_stream(options)?;
        let shape = self.get_shape(&stream);
        shape.value().await?;
        Ok(shape)
    }

    /// Waits for `shape` to sync, captures it, and stores the capture under
    /// its options hash.
    pub async fn dehydrate(&self, shape: &Shape) -> ShapeResult<DehydratedShape> {
        let rows = shape.value().await?;
        let captured = DehydratedShape {
            rows: rows
                .iter()
                .map(|(key, row)| (key.clone(), row.clone()))
                .collect(),
            last_synced_at: shape.last_synced_at(),
            offset: shape.last_offset(),
            handle: shape.handle(),
        };
        let hash = shape.source().options_hash();
        self.set_dehydrated_state(hash.as_str(), captured.clone());
        Ok(captured)
    }

    /// Stores a captured shape under `hash`.
    pub fn set_dehydrated_state(&self, hash: impl Into<String>, shape: DehydratedShape) {
        self.dehydrated.lock().insert(hash.into(), shape);
    }

    /// Everything captured so far.
    pub fn get_dehydrated_state(&self) -> DehydratedState {
        DehydratedState {
            shapes: self.dehydrated.lock().clone(),
        }
    }

    /// Adds captured shapes; later lookups resume from them.
    pub fn hydrate_from_state(&self, state: DehydratedState) {
        self.dehydrated.lock().extend(state.shapes);
    }

    /// Number of cached streams, including aborted ones not yet evicted.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Number of cached shapes.
    pub fn shape_count(&self) -> usize {
        self.shapes.lock().len()
    }

    /// Aborts every cached stream and empties the cache.
    ///
    /// Dehydrated state is kept.
    pub fn clear(&self) {
        let streams: Vec<ShapeStream> = self.streams.lock().drain().map(|(_, stream)| stream).collect();
        self.shapes.lock().clear();
        for stream in streams {
            stream.abort();
        }
    }
}

impl fmt::Debug for ShapeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeClient")
            .field("streams", &self.stream_count())
            .field("shapes", &self.shape_count())
            .field("dehydrated", &self.dehydrated.lock().len())
            .finish()
    }
}
