//! The observable surface shared by streams and stream decorators.

use crate::config::{LogMode, OptionsHash};
use crate::error::ShapeError;
use crate::signal::AbortSignal;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shapesync_protocol::{Message, Offset, ShapeHandle};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives each published batch.
pub type MessagesCallback = Arc<dyn Fn(&[Message]) + Send + Sync>;

/// Receives errors that escaped the retry policy.
pub type ErrorCallback = Arc<dyn Fn(&ShapeError) + Send + Sync>;

/// A pair of callbacks registered with a [`ShapeSource`].
#[derive(Clone)]
pub struct Subscriber {
    /// Called with every batch, in order.
    pub on_messages: MessagesCallback,
    /// Called when a request fails terminally.
    pub on_error: Option<ErrorCallback>,
}

impl Subscriber {
    /// Creates a subscriber without an error callback.
    pub fn new<F>(on_messages: F) -> Self
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        Self {
            on_messages: Arc::new(on_messages),
            on_error: None,
        }
    }

    /// Adds an error callback.
    pub fn with_error<E>(mut self, on_error: E) -> Self
    where
        E: Fn(&ShapeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`; unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription that runs `cancel` once, on unsubscribe or drop.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribes now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keeps the subscription for the lifetime of the source.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Ordered set of callbacks.
///
/// Callbacks are invoked from a snapshot so that no lock is held while user
/// code runs; a callback may subscribe or unsubscribe freely.
pub(crate) struct SubscriberList<T> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, T>>,
}

impl<T: Clone> SubscriberList<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adds an entry and returns its id.
    pub(crate) fn insert(&self, entry: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, entry);
        id
    }

    /// Removes an entry; returns the remaining count if it was present.
    pub(crate) fn remove(&self, id: u64) -> Option<usize> {
        let mut entries = self.entries.lock();
        entries.remove(&id).map(|_| entries.len())
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A publisher of shape log batches.
///
/// Implemented by [`ShapeStream`](crate::ShapeStream) and by decorators such
/// as [`ReduceStream`](crate::ReduceStream), so either can feed a
/// [`Shape`](crate::Shape).
pub trait ShapeSource: Send + Sync {
    /// Registers callbacks; batches published after this call are delivered.
    fn subscribe_with(&self, subscriber: Subscriber) -> Subscription;

    /// Offset of the last accepted batch.
    fn last_offset(&self) -> Offset;

    /// Current shape handle, once known.
    fn shape_handle(&self) -> Option<ShapeHandle>;

    /// True once the source has caught up with the log.
    fn is_up_to_date(&self) -> bool;

    /// True until the first up-to-date; never true again afterwards.
    fn is_loading(&self) -> bool;

    /// True while the last request reached the server.
    fn is_connected(&self) -> bool;

    /// When the source last became up to date.
    fn last_synced_at(&self) -> Option<DateTime<Utc>>;

    /// The terminal error that halted the source, if any.
    fn error(&self) -> Option<ShapeError>;

    /// Abort signal of the underlying stream.
    fn signal(&self) -> AbortSignal;

    /// Normalized identity of the underlying stream.
    fn options_hash(&self) -> OptionsHash;

    /// Log mode of the underlying stream.
    fn log_mode(&self) -> LogMode;

    /// Table of the underlying stream, if configured.
    fn table(&self) -> Option<String>;

    /// True if the underlying stream aborts once nothing listens to it.
    fn aborts_when_idle(&self) -> bool;

    /// Registers a batch callback.
    fn subscribe<F>(&self, on_messages: F) -> Subscription
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe_with(Subscriber::new(on_messages))
    }

    /// Registers a batch callback and an error callback.
    fn subscribe_with_error<F, E>(&self, on_messages: F, on_error: E) -> Subscription
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
        E: Fn(&ShapeError) + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe_with(Subscriber::new(on_messages).with_error(on_error))
    }
}
