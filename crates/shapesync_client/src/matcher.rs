//! Confirming local writes against the shape log.
//!
//! A client that writes through its own API issues the write, then waits for
//! the change to come back through the log before treating it as confirmed:
//!
//! ```ignore
//! let confirmed = match_stream(&stream, [Operation::Insert], match_by("id", "id1"));
//! api.create_todo("id1").await?;
//! confirmed.await?;
//! ```
//!
//! What to do with optimistic state when a write is never confirmed is left
//! to the caller.

use crate::error::{ShapeError, ShapeResult};
use crate::source::{ShapeSource, Subscriber};
use parking_lot::Mutex;
use serde_json::Value;
use shapesync_protocol::{ChangeMessage, Message, Operation};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Matches changes whose `column` equals `value`.
pub fn match_by(
    column: impl Into<String>,
    value: impl Into<Value>,
) -> impl Fn(&ChangeMessage) -> bool + Send + Sync + 'static {
    let column = column.into();
    let value = value.into();
    move |change| change.value.get(&column) == Some(&value)
}

/// Matches changes committed in transaction `txid`.
pub fn match_txid(txid: u64) -> impl Fn(&ChangeMessage) -> bool + Send + Sync + 'static {
    move |change| change.txids().contains(&txid)
}

/// Waits for the first change with one of `operations` that satisfies
/// `predicate`.
///
/// Subscribes before returning, so batches published between this call and
/// the first poll of the returned future are inspected too. Fails with the
/// source's error if it errors first (or already has), and with
/// [`ShapeError::Aborted`] if the source is aborted.
pub fn match_stream<S, I, P>(
    source: &S,
    operations: I,
    predicate: P,
) -> impl Future<Output = ShapeResult<ChangeMessage>> + Send + 'static
where
    S: ShapeSource + ?Sized,
    I: IntoIterator<Item = Operation>,
    P: Fn(&ChangeMessage) -> bool + Send + Sync + 'static,
{
    let signal = source.signal();
    let failed = match source.error() {
        Some(err) => Some(err),
        None if signal.is_aborted() => Some(ShapeError::Aborted),
        None => None,
    };

    let operations: Vec<Operation> = operations.into_iter().collect();
    let (tx, rx) = oneshot::channel::<ShapeResult<ChangeMessage>>();
    let on_match = Arc::new(Mutex::new(Some(tx)));
    let on_error = Arc::clone(&on_match);

    let subscription = failed.is_none().then(|| {
        let subscriber = Subscriber::new(move |messages| {
            let found = messages
                .iter()
                .filter_map(Message::as_change)
                .find(|change| operations.contains(&change.operation) && predicate(change));
            if let Some(change) = found {
                if let Some(tx) = on_match.lock().take() {
                    debug!("Write matched {} {}", change.operation, change.key);
                    let _ = tx.send(Ok(change.clone()));
                }
            }
        })
        .with_error(move |err| {
            if let Some(tx) = on_error.lock().take() {
                let _ = tx.send(Err(err.clone()));
            }
        });
        source.subscribe_with(subscriber)
    });

    async move {
        if let Some(err) = failed {
            return Err(err);
        }
        let result = tokio::select! {
            biased;
            result = rx => result.unwrap_or(Err(ShapeError::Aborted)),
            _ = signal.aborted() => Err(ShapeError::Aborted),
        };
        drop(subscription);
        result
    }
}
