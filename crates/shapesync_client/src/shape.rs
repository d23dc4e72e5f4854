//! Materialized view over a shape source.

use crate::config::LogMode;
use crate::error::{ShapeError, ShapeResult};
use crate::source::{ShapeSource, Subscriber, SubscriberList, Subscription};
use crate::stream::ShapeStream;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use shapesync_protocol::{ChangeMessage, Control, Message, Offset, Operation, Row, ShapeHandle};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

/// Rows keyed by primary key, in first-insert order.
pub type ShapeData = IndexMap<String, Row>;

/// What a [`Shape`] hands its subscribers.
#[derive(Debug, Clone)]
pub struct ShapeUpdate {
    /// Immutable snapshot of the rows.
    pub rows: Arc<ShapeData>,
    /// True until the first up-to-date.
    pub is_loading: bool,
    /// When the shape last became up to date.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Error reported by the source, if any.
    pub error: Option<ShapeError>,
}

impl ShapeUpdate {
    /// The rows as a list.
    pub fn values(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }
}

/// Receives shape updates.
pub type ShapeCallback = Arc<dyn Fn(&ShapeUpdate) + Send + Sync>;

#[derive(Default)]
struct ShapeState {
    data: Arc<ShapeData>,
    inserted_keys: HashSet<String>,
    has_synced: bool,
    last_synced_at: Option<DateTime<Utc>>,
    error: Option<ShapeError>,
    dirty: bool,
}

impl ShapeState {
    fn apply(&mut self, change: &ChangeMessage, log: LogMode) {
        let changes_only = log == LogMode::ChangesOnly;
        let data = Arc::make_mut(&mut self.data);

        match change.operation {
            Operation::Insert => {
                if changes_only {
                    self.inserted_keys.insert(change.key.clone());
                }
                data.insert(change.key.clone(), change.value.clone());
            }
            Operation::Update => {
                if changes_only && !self.inserted_keys.contains(&change.key) {
                    return;
                }
                match data.get_mut(&change.key) {
                    Some(row) => {
                        for (column, value) in &change.value {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                    None => {
                        data.insert(change.key.clone(), change.value.clone());
                    }
                }
            }
            Operation::Delete => {
                if changes_only && !self.inserted_keys.remove(&change.key) {
                    return;
                }
                data.shift_remove(&change.key);
            }
        }
        self.dirty = true;
    }

    fn clear(&mut self) {
        self.data = Arc::new(ShapeData::new());
        self.inserted_keys.clear();
        self.error = None;
        self.dirty = true;
    }

    fn update(&self) -> ShapeUpdate {
        ShapeUpdate {
            rows: Arc::clone(&self.data),
            is_loading: !self.has_synced,
            last_synced_at: self.last_synced_at,
            error: self.error.clone(),
        }
    }
}

struct ShapeInner {
    source: Arc<dyn ShapeSource>,
    state: RwLock<ShapeState>,
    subscribers: SubscriberList<ShapeCallback>,
    attachment: Mutex<Option<Subscription>>,
    changed: watch::Sender<u64>,
}

/// A materialized view of a shape.
///
/// Applies every batch from its source to an in-memory map and notifies
/// subscribers once a batch brings it up to date. Readers only ever see
/// states at batch boundaries; snapshots are immutable and never change
/// after they are handed out.
#[derive(Clone)]
pub struct Shape {
    inner: Arc<ShapeInner>,
}

impl Shape {
    /// Creates a shape and subscribes it to `source`.
    pub fn new(source: Arc<dyn ShapeSource>) -> Self {
        let (changed, _) = watch::channel(0);
        let state = ShapeState {
            error: source.error(),
            ..ShapeState::default()
        };
        let inner = Arc::new(ShapeInner {
            source,
            state: RwLock::new(state),
            subscribers: SubscriberList::new(),
            attachment: Mutex::new(None),
            changed,
        });
        Self::attach(&inner);
        Self { inner }
    }

    /// Creates a shape over a stream.
    pub fn from_stream(stream: &ShapeStream) -> Self {
        Self::new(Arc::new(stream.clone()))
    }

    fn attach(inner: &Arc<ShapeInner>) {
        let mut attachment = inner.attachment.lock();
        if attachment.is_some() {
            return;
        }

        let on_messages: Weak<ShapeInner> = Arc::downgrade(inner);
        let on_error = Weak::clone(&on_messages);
        let subscriber = Subscriber::new(move |messages| {
            if let Some(inner) = on_messages.upgrade() {
                inner.process(messages);
            }
        })
        .with_error(move |err| {
            if let Some(inner) = on_error.upgrade() {
                inner.fail(err);
            }
        });
        *attachment = Some(inner.source.subscribe_with(subscriber));
    }

    /// Stops listening to the source; the last materialized state stays readable.
    pub fn detach(&self) {
        let subscription = self.inner.attachment.lock().take();
        drop(subscription);
    }

    /// Subscribes to the source again after [`detach`](Self::detach).
    pub fn reattach(&self) {
        Self::attach(&self.inner);
    }

    /// Returns true if both handles refer to the same shape.
    pub fn ptr_eq(&self, other: &Shape) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns true while the shape is subscribed to its source.
    pub fn is_attached(&self) -> bool {
        self.inner.attachment.lock().is_some()
    }

    /// Seeds rows captured elsewhere (e.g. during server rendering).
    ///
    /// Seeded rows count as synced, so [`value`](Self::value) resolves
    /// immediately.
    pub fn initialize_with_ssr_data(&self, rows: ShapeData, last_synced_at: Option<DateTime<Utc>>) {
        let mut state = self.inner.state.write();
        if state.data.is_empty() {
            if self.inner.source.log_mode() == LogMode::ChangesOnly {
                state.inserted_keys = rows.keys().cloned().collect();
            }
            state.data = Arc::new(rows);
            state.has_synced = true;
            state.last_synced_at = last_synced_at.or(state.last_synced_at);
        }
        drop(state);
        self.inner.changed.send_modify(|version| *version += 1);
    }

    /// Registers a callback for updates.
    ///
    /// When the last subscriber leaves and the source aborts idle streams, the
    /// shape detaches from its source.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ShapeUpdate) + Send + Sync + 'static,
    {
        let callback: ShapeCallback = Arc::new(callback);
        let id = self.inner.subscribers.insert(callback);
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.subscribers.remove(id) == Some(0) && inner.source.aborts_when_idle() {
                debug!("Shape has no subscribers left, detaching");
                let subscription = inner.attachment.lock().take();
                drop(subscription);
            }
        })
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Waits until the shape is synced and returns its rows by key.
    ///
    /// Fails with the source's error, or with [`ShapeError::Aborted`] if the
    /// source is aborted before syncing.
    pub async fn value(&self) -> ShapeResult<Arc<ShapeData>> {
        let mut changed = self.inner.changed.subscribe();
        let signal = self.inner.source.signal();
        loop {
            {
                let state = self.inner.state.read();
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if state.has_synced {
                    return Ok(Arc::clone(&state.data));
                }
            }
            if signal.is_aborted() {
                return Err(ShapeError::Aborted);
            }
            tokio::select! {
                result = changed.changed() => {
                    if result.is_err() {
                        return Err(ShapeError::Aborted);
                    }
                }
                _ = signal.aborted() => {}
            }
        }
    }

    /// Waits until the shape is synced and returns its rows as a list.
    pub async fn rows(&self) -> ShapeResult<Vec<Row>> {
        Ok(self.value().await?.values().cloned().collect())
    }

    /// Current rows by key, without waiting.
    pub fn current_value(&self) -> Arc<ShapeData> {
        Arc::clone(&self.inner.state.read().data)
    }

    /// Current rows as a list, without waiting.
    pub fn current_rows(&self) -> Vec<Row> {
        self.current_value().values().cloned().collect()
    }

    /// True until the first up-to-date.
    pub fn is_loading(&self) -> bool {
        !self.inner.state.read().has_synced
    }

    /// When the shape last became up to date.
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().last_synced_at
    }

    /// Error reported by the source, if any.
    pub fn error(&self) -> Option<ShapeError> {
        self.inner.state.read().error.clone()
    }

    /// True once the source has caught up.
    pub fn is_up_to_date(&self) -> bool {
        self.inner.source.is_up_to_date()
    }

    /// True while the source's last request reached the server.
    pub fn is_connected(&self) -> bool {
        self.inner.source.is_connected()
    }

    /// Offset of the source.
    pub fn last_offset(&self) -> Offset {
        self.inner.source.last_offset()
    }

    /// Handle of the source.
    pub fn handle(&self) -> Option<ShapeHandle> {
        self.inner.source.shape_handle()
    }

    /// The source this shape materializes.
    pub fn source(&self) -> &Arc<dyn ShapeSource> {
        &self.inner.source
    }

    /// Current state as an update.
    pub fn snapshot(&self) -> ShapeUpdate {
        self.inner.state.read().update()
    }
}

impl ShapeInner {
    fn process(&self, messages: &[Message]) {
        let log = self.source.log_mode();
        let update = {
            let mut state = self.state.write();
            let was_synced = state.has_synced;
            let had_error = state.error.take().is_some();
            let mut up_to_date = false;

            for message in messages {
                match message {
                    Message::Change(change) => state.apply(change, log),
                    Message::Control(control) => match control.control {
                        Control::UpToDate => up_to_date = true,
                        Control::MustRefetch => {
                            debug!("Shape cleared by must-refetch");
                            state.clear();
                        }
                        Control::SnapshotEnd => {}
                    },
                }
            }

            if !up_to_date {
                None
            } else {
                state.has_synced = true;
                state.last_synced_at = Some(Utc::now());
                let notify = state.dirty || had_error || !was_synced;
                state.dirty = false;
                notify.then(|| state.update())
            }
        };

        if let Some(update) = update {
            self.changed.send_modify(|version| *version += 1);
            for callback in self.subscribers.snapshot() {
                callback(&update);
            }
        }
    }

    fn fail(&self, err: &ShapeError) {
        let update = {
            let mut state = self.state.write();
            state.error = Some(err.clone());
            state.update()
        };
        self.changed.send_modify(|version| *version += 1);
        for callback in self.subscribers.snapshot() {
            callback(&update);
        }
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Shape")
            .field("rows", &state.data.len())
            .field("has_synced", &state.has_synced)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}
