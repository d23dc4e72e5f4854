//! Folding a change log into a single value.
//!
//! A [`ReduceStream`] sits between a stream and its consumers. Every change
//! message is folded into an accumulator; each time the base catches up, the
//! accumulator is published as one synthetic insert under a stable key,
//! followed by the up-to-date message itself. A [`Shape`](crate::Shape) fed
//! by a reduce stream therefore holds exactly one row: the folded value.

use crate::config::{LogMode, OptionsHash};
use crate::error::ShapeError;
use crate::signal::AbortSignal;
use crate::source::{ShapeSource, Subscriber, SubscriberList, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use shapesync_protocol::{ChangeMessage, Control, Message, Offset, Row, ShapeHandle};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Folds one change into the accumulator.
pub type ReduceFn<A> = Arc<dyn Fn(A, &ChangeMessage) -> A + Send + Sync>;

/// Key used when the base stream has no table.
pub const DEFAULT_REDUCE_KEY: &str = "reduced";

struct ReduceInner<A> {
    base: Arc<dyn ShapeSource>,
    reduce: ReduceFn<A>,
    initial: A,
    key: String,
    accumulator: Mutex<A>,
    subscribers: SubscriberList<Subscriber>,
    attachment: Mutex<Option<Subscription>>,
}

/// A [`ShapeSource`] that replaces a stream's changes with a folded value.
pub struct ReduceStream<A> {
    inner: Arc<ReduceInner<A>>,
}

impl<A> Clone for ReduceStream<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> ReduceStream<A>
where
    A: Serialize + Clone + Send + Sync + 'static,
{
    /// Creates a reduce stream keyed by the base stream's table name.
    pub fn new<F>(base: Arc<dyn ShapeSource>, initial: A, reduce: F) -> Self
    where
        F: Fn(A, &ChangeMessage) -> A + Send + Sync + 'static,
    {
        let key = base
            .table()
            .unwrap_or_else(|| DEFAULT_REDUCE_KEY.to_string());
        Self::with_key(base, key, initial, reduce)
    }

    /// Creates a reduce stream that publishes under `key`.
    pub fn with_key<F>(base: Arc<dyn ShapeSource>, key: impl Into<String>, initial: A, reduce: F) -> Self
    where
        F: Fn(A, &ChangeMessage) -> A + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ReduceInner {
                base,
                reduce: Arc::new(reduce),
                accumulator: Mutex::new(initial.clone()),
                initial,
                key: key.into(),
                subscribers: SubscriberList::new(),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Current accumulator value.
    pub fn accumulator(&self) -> A {
        self.inner.accumulator.lock().clone()
    }

    /// Key the folded value is published under.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The stream being folded.
    pub fn base(&self) -> &Arc<dyn ShapeSource> {
        &self.inner.base
    }

    fn attach(inner: &Arc<ReduceInner<A>>) {
        let mut attachment = inner.attachment.lock();
        if attachment.is_some() {
            return;
        }

        let on_messages: Weak<ReduceInner<A>> = Arc::downgrade(inner);
        let on_error = Weak::clone(&on_messages);
        let subscriber = Subscriber::new(move |messages| {
            if let Some(inner) = on_messages.upgrade() {
                inner.process(messages);
            }
        })
        .with_error(move |err| {
            if let Some(inner) = on_error.upgrade() {
                inner.forward_error(err);
            }
        });
        *attachment = Some(inner.base.subscribe_with(subscriber));
    }
}

impl<A> ReduceInner<A>
where
    A: Serialize + Clone + Send + Sync + 'static,
{
    fn process(&self, messages: &[Message]) {
        let mut out = Vec::new();

        for message in messages {
            match message {
                Message::Change(change) => {
                    let current = self.accumulator.lock().clone();
                    let next = (self.reduce)(current, change);
                    *self.accumulator.lock() = next;
                }
                Message::Control(control) => {
                    match control.control {
                        Control::UpToDate => {
                            if let Some(folded) = self.folded_message() {
                                out.push(folded);
                            }
                        }
                        Control::MustRefetch => {
                            *self.accumulator.lock() = self.initial.clone();
                        }
                        Control::SnapshotEnd => {}
                    }
                    out.push(message.clone());
                }
            }
        }

        if out.is_empty() {
            return;
        }
        for subscriber in self.subscribers.snapshot() {
            (subscriber.on_messages)(&out);
        }
    }

    fn folded_message(&self) -> Option<Message> {
        let accumulator = self.accumulator.lock().clone();
        let value = match serde_json::to_value(&accumulator) {
            Ok(Value::Object(row)) => row,
            Ok(other) => {
                let mut row = Row::new();
                row.insert("value".into(), other);
                row
            }
            Err(err) => {
                warn!("Cannot serialize reduced value for {}: {}", self.key, err);
                return None;
            }
        };
        Some(Message::Change(ChangeMessage::insert(self.key.clone(), value)))
    }

    fn forward_error(&self, err: &ShapeError) {
        for subscriber in self.subscribers.snapshot() {
            if let Some(on_error) = &subscriber.on_error {
                on_error(err);
            }
        }
    }
}

impl<A> ShapeSource for ReduceStream<A>
where
    A: Serialize + Clone + Send + Sync + 'static,
{
    fn subscribe_with(&self, subscriber: Subscriber) -> Subscription {
        let id = self.inner.subscribers.insert(subscriber);
        Self::attach(&self.inner);

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.subscribers.remove(id) == Some(0) {
                let subscription = inner.attachment.lock().take();
                drop(subscription);
            }
        })
    }

    fn last_offset(&self) -> Offset {
        self.inner.base.last_offset()
    }

    fn shape_handle(&self) -> Option<ShapeHandle> {
        self.inner.base.shape_handle()
    }

    fn is_up_to_date(&self) -> bool {
        self.inner.base.is_up_to_date()
    }

    fn is_loading(&self) -> bool {
        self.inner.base.is_loading()
    }

    fn is_connected(&self) -> bool {
        self.inner.base.is_connected()
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.inner.base.last_synced_at()
    }

    fn error(&self) -> Option<ShapeError> {
        self.inner.base.error()
    }

    fn signal(&self) -> AbortSignal {
        self.inner.base.signal()
    }

    fn options_hash(&self) -> OptionsHash {
        self.inner.base.options_hash()
    }

    fn log_mode(&self) -> LogMode {
        self.inner.base.log_mode()
    }

    fn table(&self) -> Option<String> {
        self.inner.base.table()
    }

    fn aborts_when_idle(&self) -> bool {
        self.inner.base.aborts_when_idle()
    }
}
