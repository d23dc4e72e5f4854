//! Persistence of stream positions across restarts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shapesync_protocol::{Offset, ShapeHandle};
use std::collections::HashMap;

/// Position a stream can resume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Last offset the stream reached.
    pub offset: Offset,
    /// Handle the offset belongs to.
    pub handle: ShapeHandle,
}

/// Storage for resume positions, keyed by a caller-chosen name.
///
/// Stores are consulted once when a stream starts without an explicit
/// offset and written every time the stream becomes up to date.
pub trait ResumeStore: Send + Sync {
    /// Loads the saved position, if any.
    fn load(&self, key: &str) -> Option<ResumeState>;

    /// Saves a position, replacing any previous one.
    fn save(&self, key: &str, state: &ResumeState);

    /// Forgets a saved position.
    fn clear(&self, key: &str);
}

/// An in-memory resume store.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    states: Mutex<HashMap<String, ResumeState>>,
}

impl MemoryResumeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load(&self, key: &str) -> Option<ResumeState> {
        self.states.lock().get(key).cloned()
    }

    fn save(&self, key: &str, state: &ResumeState) {
        self.states.lock().insert(key.to_string(), state.clone());
    }

    fn clear(&self, key: &str) {
        self.states.lock().remove(key);
    }
}
