//! Property-based test generators using proptest.
//!
//! Message sequences stay within a small key space so that updates and
//! deletes regularly hit existing rows.

use proptest::prelude::*;
use serde_json::{json, Value};
use shapesync_protocol::{ChangeMessage, ControlMessage, Message, Operation, Row};
use std::collections::BTreeMap;

/// Strategy for row keys drawn from `k0..k{keys}`.
pub fn key_strategy(keys: usize) -> impl Strategy<Value = String> {
    (0..keys.max(1)).prop_map(|i| format!("k{}", i))
}

/// Strategy for operations.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => Just(Operation::Insert),
        2 => Just(Operation::Update),
        1 => Just(Operation::Delete),
    ]
}

/// Strategy for a single change message.
pub fn change_strategy(keys: usize) -> impl Strategy<Value = ChangeMessage> {
    (
        key_strategy(keys),
        operation_strategy(),
        "[a-z]{0,6}",
        any::<bool>(),
    )
        .prop_map(|(key, operation, title, done)| {
            let value = match operation {
                Operation::Delete => row(json!({"id": key})),
                Operation::Update if done => row(json!({"id": key, "done": true})),
                _ => row(json!({"id": key, "title": title, "done": done})),
            };
            ChangeMessage::new(key, operation, value)
        })
}

/// Strategy for a change log of up to `max_len` changes.
pub fn change_log_strategy(keys: usize, max_len: usize) -> impl Strategy<Value = Vec<ChangeMessage>> {
    prop::collection::vec(change_strategy(keys), 0..=max_len)
}

/// Strategy for a change log and a set of cut points splitting it into
/// batches.
pub fn split_log_strategy(
    keys: usize,
    max_len: usize,
) -> impl Strategy<Value = (Vec<ChangeMessage>, Vec<usize>)> {
    change_log_strategy(keys, max_len).prop_flat_map(|log| {
        let len = log.len();
        (Just(log), prop::collection::vec(0..=len, 0..4))
    })
}

/// Splits `log` at `cuts` into batches; every batch ends with an up-to-date.
pub fn into_batches(log: &[ChangeMessage], cuts: &[usize]) -> Vec<Vec<Message>> {
    let mut cuts: Vec<usize> = cuts.iter().map(|c| (*c).min(log.len())).collect();
    cuts.push(log.len());
    cuts.sort_unstable();
    cuts.dedup();

    let mut batches = Vec::with_capacity(cuts.len());
    let mut start = 0;
    for cut in cuts {
        let mut batch: Vec<Message> = log[start..cut].iter().cloned().map(Message::Change).collect();
        batch.push(Message::Control(ControlMessage::up_to_date()));
        batches.push(batch);
        start = cut;
    }
    batches
}

/// Reference replay of a full log: insert sets, update merges, delete removes.
pub fn replay(log: &[ChangeMessage]) -> BTreeMap<String, Row> {
    let mut rows = BTreeMap::new();
    for change in log {
        match change.operation {
            Operation::Insert => {
                rows.insert(change.key.clone(), change.value.clone());
            }
            Operation::Update => {
                let row = rows.entry(change.key.clone()).or_insert_with(Row::new);
                for (column, value) in &change.value {
                    row.insert(column.clone(), value.clone());
                }
            }
            Operation::Delete => {
                rows.remove(&change.key);
            }
        }
    }
    rows
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}
