//! A shape source driven by the test.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use shapesync_client::{
    AbortSignal, LogMode, OptionsHash, ShapeError, ShapeSource, Subscriber, Subscription,
};
use shapesync_protocol::{Message, Offset, ShapeHandle};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ScriptedState {
    batches: u64,
    up_to_date: bool,
    synced_at: Option<DateTime<Utc>>,
    error: Option<ShapeError>,
}

/// Publishes exactly the batches it is handed, with no network involved.
///
/// Useful for driving a [`Shape`](shapesync_client::Shape) or
/// [`ReduceStream`](shapesync_client::ReduceStream) through precise message
/// sequences.
pub struct ScriptedSource {
    subscribers: Arc<Mutex<BTreeMap<u64, Subscriber>>>,
    next_id: AtomicU64,
    state: RwLock<ScriptedState>,
    signal: AbortSignal,
    table: String,
    log: LogMode,
}

impl ScriptedSource {
    /// Creates a source for `table` with a full log.
    pub fn new(table: impl Into<String>) -> Arc<Self> {
        Self::with_log_mode(table, LogMode::Full)
    }

    /// Creates a source with the given log mode.
    pub fn with_log_mode(table: impl Into<String>, log: LogMode) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(0),
            state: RwLock::new(ScriptedState::default()),
            signal: AbortSignal::new(),
            table: table.into(),
            log,
        })
    }

    /// Delivers one batch to every subscriber.
    pub fn publish(&self, messages: &[Message]) {
        if self.signal.is_aborted() {
            return;
        }
        {
            let mut state = self.state.write();
            state.batches += 1;
            state.error = None;
            if messages.iter().any(Message::is_up_to_date) {
                state.up_to_date = true;
                state.synced_at = Some(Utc::now());
            }
        }
        let subscribers: Vec<Subscriber> = self.subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            (subscriber.on_messages)(messages);
        }
    }

    /// Reports an error to every subscriber.
    pub fn fail(&self, error: ShapeError) {
        self.state.write().error = Some(error.clone());
        let subscribers: Vec<Subscriber> = self.subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            if let Some(on_error) = &subscriber.on_error {
                on_error(&error);
            }
        }
    }

    /// Fires the abort signal; later batches are dropped.
    pub fn abort(&self) {
        self.signal.abort();
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl ShapeSource for ScriptedSource {
    fn subscribe_with(&self, subscriber: Subscriber) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, subscriber);
        let subscribers = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            subscribers.lock().remove(&id);
        })
    }

    fn last_offset(&self) -> Offset {
        match self.state.read().batches {
            0 => Offset::Initial,
            batches => Offset::log(batches, 0),
        }
    }

    fn shape_handle(&self) -> Option<ShapeHandle> {
        Some(ShapeHandle::new(format!("scripted-{}", self.table)))
    }

    fn is_up_to_date(&self) -> bool {
        self.state.read().up_to_date
    }

    fn is_loading(&self) -> bool {
        self.state.read().synced_at.is_none()
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_aborted()
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().synced_at
    }

    fn error(&self) -> Option<ShapeError> {
        self.state.read().error.clone()
    }

    fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    fn options_hash(&self) -> OptionsHash {
        OptionsHash::new(format!("scripted:{}", self.table))
    }

    fn log_mode(&self) -> LogMode {
        self.log
    }

    fn table(&self) -> Option<String> {
        Some(self.table.clone())
    }

    fn aborts_when_idle(&self) -> bool {
        false
    }
}
