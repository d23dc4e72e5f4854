//! Integration tests for shape streams, shapes and the shape cache against
//! the in-memory shape log server.

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use shapesync_client::protocol::{ChangeMessage, Operation, Row};
use shapesync_client::{
    match_by, match_stream, AbortSignal, MemoryResumeStore, ReduceStream, ResumeStore,
    RetryOverride, RunState, Shape, ShapeClient, ShapeData, ShapeError, ShapeSource, ShapeStream,
    ShapeUpdate,
};
use shapesync_testkit::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn as_map(data: &ShapeData) -> BTreeMap<String, Row> {
    data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[tokio::test]
async fn empty_shape_finishes_loading() {
    let server = todos_server();
    let stream = ShapeStream::new(stream_options(&server, TODOS).with_subscribe(false)).unwrap();
    let shape = Shape::from_stream(&stream);

    within(WAIT, stream.start()).await.unwrap();

    assert!(!shape.is_loading());
    assert!(shape.current_rows().is_empty());
    assert_eq!(shape.error(), None);
    assert_eq!(stream.run_state(), RunState::Finished);
}

#[tokio::test]
async fn live_updates_extend_rows_without_reloading() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "t")).unwrap();

    let stream = ShapeStream::new(stream_options(&server, TODOS)).unwrap();
    let shape = Shape::from_stream(&stream);
    let updates: Arc<Mutex<Vec<ShapeUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let _subscription = shape.subscribe(move |update| sink.lock().push(update.clone()));

    let rows = within(WAIT, shape.rows()).await.unwrap();
    assert_eq!(rows, vec![row(todo("1", "t"))]);

    server.insert(TODOS, todo("2", "t2")).unwrap();
    assert!(eventually(WAIT, || shape.current_rows().len() == 2).await);

    assert_eq!(
        shape.current_rows(),
        vec![row(todo("1", "t")), row(todo("2", "t2"))]
    );
    assert!(!shape.is_loading());
    let updates = updates.lock();
    assert!(updates.len() >= 2);
    assert!(updates.iter().all(|update| !update.is_loading));
    stream.abort();
}

#[tokio::test]
async fn snapshots_freeze_after_unsubscribe_and_abort() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "t")).unwrap();

    let signal = AbortSignal::new();
    let stream =
        ShapeStream::new(stream_options(&server, TODOS).with_signal(signal.clone())).unwrap();
    let shape = Shape::from_stream(&stream);
    let subscription = shape.subscribe(|_| {});
    let snapshot = within(WAIT, shape.value()).await.unwrap();

    subscription.unsubscribe();
    signal.abort();
    server.insert(TODOS, todo("2", "late")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(snapshot.len(), 1);
    assert_eq!(shape.current_value().len(), 1);
    assert!(!shape.is_attached());
    assert!(eventually(WAIT, || stream.run_state() == RunState::Finished).await);
}

#[tokio::test]
async fn rotated_handle_refetches_from_scratch() {
    let server = todos_server();
    server.insert(TODOS, todo("a", "A")).unwrap();
    server.insert(TODOS, todo("b", "B")).unwrap();

    let stream = ShapeStream::new(stream_options(&server, TODOS)).unwrap();
    let shape = Shape::from_stream(&stream);
    let _subscription = shape.subscribe(|_| {});
    assert_eq!(within(WAIT, shape.rows()).await.unwrap().len(), 2);

    server.delete(TODOS, json!({"id": "a"})).unwrap();
    server.delete(TODOS, json!({"id": "b"})).unwrap();
    server.insert(TODOS, todo("c", "C")).unwrap();
    let handle = server.rotate(TODOS).unwrap();

    assert!(eventually(WAIT, || stream.shape_handle() == Some(handle.clone())).await);
    assert!(eventually(WAIT, || shape.current_rows() == vec![row(todo("c", "C"))]).await);
    assert!(!shape.is_loading());
    stream.abort();
}

#[tokio::test]
async fn resume_store_skips_history() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "old")).unwrap();
    let store = Arc::new(MemoryResumeStore::new());
    let options = stream_options(&server, TODOS)
        .with_subscribe(false)
        .with_resume_store(store.clone(), "todos");

    let first = ShapeStream::new(options.clone()).unwrap();
    within(WAIT, first.start()).await.unwrap();
    let saved = store.load("todos").unwrap();
    assert_eq!(Some(saved.offset), server.offset(TODOS));

    server.insert(TODOS, todo("2", "new")).unwrap();
    let before = server.request_count();
    let second = ShapeStream::new(options).unwrap();
    let shape = Shape::from_stream(&second);
    within(WAIT, second.start()).await.unwrap();

    assert_eq!(shape.current_rows(), vec![row(todo("2", "new"))]);
    let request = &server.requests()[before];
    assert_eq!(request.param("offset"), Some(saved.offset.to_string().as_str()));
    assert_eq!(request.param("handle"), Some(saved.handle.as_str()));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "t")).unwrap();
    server.fail_next(503, 2);

    let stream = ShapeStream::new(stream_options(&server, TODOS).with_subscribe(false)).unwrap();
    let shape = Shape::from_stream(&stream);
    within(WAIT, stream.start()).await.unwrap();

    assert_eq!(server.request_count(), 3);
    assert_eq!(shape.current_rows().len(), 1);
}

#[tokio::test]
async fn terminal_errors_reach_shapes_and_callbacks() {
    let server = todos_server();
    server.fail_next(401, 1);

    let stream = ShapeStream::new(stream_options(&server, TODOS).with_subscribe(false)).unwrap();
    let shape = Shape::from_stream(&stream);
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let _subscription = stream.subscribe_with_error(
        |_| {},
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    let err = within(WAIT, stream.start()).await.unwrap_err();
    assert!(matches!(err, ShapeError::Http { status: 401, .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(shape.error(), Some(err.clone()));
    assert_eq!(within(WAIT, shape.value()).await, Err(err));
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn error_handler_can_resume_with_new_headers() {
    let server = todos_server();
    server.fail_next(401, 1);

    let options = stream_options(&server, TODOS)
        .with_subscribe(false)
        .with_error_handler(|err| {
            (err.status() == Some(401))
                .then(|| RetryOverride::new().with_header("Authorization", "Bearer fresh"))
        });
    let stream = ShapeStream::new(options).unwrap();
    within(WAIT, stream.start()).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].headers.contains_key("authorization"));
    assert_eq!(
        requests[1].headers.get("authorization").map(String::as_str),
        Some("Bearer fresh")
    );
    assert_eq!(stream.error(), None);
}

#[tokio::test]
async fn cache_shares_and_dehydrated_state_resumes() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "a")).unwrap();
    server.insert(TODOS, todo("2", "b")).unwrap();
    let options = stream_options(&server, TODOS).with_subscribe(false);

    let client = ShapeClient::new();
    let shape = within(WAIT, client.preload_shape(options.clone())).await.unwrap();
    let stream = client.get_shape_stream(options.clone()).unwrap();
    assert!(client.get_shape(&stream).ptr_eq(&shape));

    let captured = within(WAIT, client.dehydrate(&shape)).await.unwrap();
    assert_eq!(captured.rows.len(), 2);
    let encoded = serde_json::to_string(&client.get_dehydrated_state()).unwrap();

    server.insert(TODOS, todo("3", "c")).unwrap();
    let before = server.request_count();

    let restored = ShapeClient::with_state(serde_json::from_str(&encoded).unwrap());
    let stream = restored.get_shape_stream(options).unwrap();
    let shape = restored.get_shape(&stream);
    assert!(!shape.is_loading());
    assert_eq!(shape.current_rows().len(), 2);

    within(WAIT, stream.start()).await.unwrap();
    assert_eq!(shape.current_rows().len(), 3);
    let request = &server.requests()[before];
    assert_eq!(request.param("offset"), Some(captured.offset.to_string().as_str()));
}

#[tokio::test]
async fn matcher_confirms_a_write_through_the_log() {
    let server = todos_server();
    let stream = ShapeStream::new(stream_options(&server, TODOS)).unwrap();
    let shape = Shape::from_stream(&stream);
    let _subscription = shape.subscribe(|_| {});
    within(WAIT, shape.value()).await.unwrap();

    let matcher = {
        let stream = stream.clone();
        tokio::spawn(async move {
            match_stream(&stream, [Operation::Insert], match_by("id", "id1")).await
        })
    };
    assert!(eventually(WAIT, || stream.subscriber_count() == 2).await);

    server.insert(TODOS, todo("other", "x")).unwrap();
    server.insert(TODOS, todo("id1", "mine")).unwrap();

    let change = within(WAIT, matcher).await.unwrap().unwrap();
    assert_eq!(change.value["title"], json!("mine"));
    assert!(eventually(WAIT, || stream.subscriber_count() == 1).await);
    stream.abort();
}

#[tokio::test]
async fn reduced_stream_materializes_one_row() {
    let server = todos_server();
    server.insert(TODOS, todo("1", "a")).unwrap();
    server.insert(TODOS, todo("2", "b")).unwrap();

    let stream = ShapeStream::new(stream_options(&server, TODOS)).unwrap();
    let reduce = ReduceStream::with_key(
        Arc::new(stream.clone()),
        "count",
        0u64,
        |count: u64, change: &ChangeMessage| match change.operation {
            Operation::Insert => count + 1,
            Operation::Delete => count.saturating_sub(1),
            Operation::Update => count,
        },
    );
    let shape = Shape::new(Arc::new(reduce.clone()));
    let _subscription = shape.subscribe(|_| {});

    let value = within(WAIT, shape.value()).await.unwrap();
    assert_eq!(value.len(), 1);
    assert_eq!(value["count"]["value"], json!(2));

    server.insert(TODOS, todo("3", "c")).unwrap();
    assert!(eventually(WAIT, || reduce.accumulator() == 3).await);
    assert!(eventually(WAIT, || shape.current_value()["count"]["value"] == json!(3)).await);
    stream.abort();
}

#[test]
fn reduce_of_a_set_union_ignores_redelivery() {
    let source = ScriptedSource::new("doc");
    let reduce = ReduceStream::new(
        source.clone(),
        BTreeSet::new(),
        |mut seen: BTreeSet<String>, change: &ChangeMessage| {
            seen.insert(change.key.clone());
            seen
        },
    );
    let shape = Shape::new(Arc::new(reduce.clone()));
    let log: Vec<ChangeMessage> = (0..3)
        .map(|i| ChangeMessage::insert(format!("op{}", i), Row::new()))
        .collect();

    for batch in into_batches(&log, &[1]) {
        source.publish(&batch);
    }
    let folded = shape.current_value()["doc"].clone();
    for batch in into_batches(&log[..2], &[]) {
        source.publish(&batch);
    }

    assert_eq!(shape.current_value()["doc"], folded);
    assert_eq!(reduce.accumulator().len(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replay_is_independent_of_batching((log, cuts) in split_log_strategy(5, 40)) {
        let split = ScriptedSource::new(TODOS);
        let split_shape = Shape::new(split.clone());
        for batch in into_batches(&log, &cuts) {
            split.publish(&batch);
        }

        let whole = ScriptedSource::new(TODOS);
        let whole_shape = Shape::new(whole.clone());
        for batch in into_batches(&log, &[]) {
            whole.publish(&batch);
        }

        let expected = replay(&log);
        prop_assert_eq!(as_map(&split_shape.current_value()), expected.clone());
        prop_assert_eq!(as_map(&whole_shape.current_value()), expected);
    }

    #[test]
    fn subscribers_converge(
        (log, cuts) in split_log_strategy(4, 24),
        joins in prop::collection::vec(0usize..4, 1..5),
    ) {
        let batches = into_batches(&log, &cuts);
        let source = ScriptedSource::new(TODOS);
        let shape = Shape::new(source.clone());

        let current_batch = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Mutex<Vec<(usize, usize, Arc<ShapeData>)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut subscriptions = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            for (subscriber, join) in joins.iter().enumerate() {
                if join % batches.len() == index {
                    let seen = Arc::clone(&seen);
                    let current_batch = Arc::clone(&current_batch);
                    subscriptions.push(shape.subscribe(move |update| {
                        let batch = current_batch.load(Ordering::SeqCst);
                        seen.lock().push((subscriber, batch, Arc::clone(&update.rows)));
                    }));
                }
            }
            current_batch.store(index, Ordering::SeqCst);
            source.publish(batch);
        }

        let seen = seen.lock();
        for index in 0..batches.len() {
            let delivered: Vec<&(usize, usize, Arc<ShapeData>)> =
                seen.iter().filter(|(_, batch, _)| *batch == index).collect();
            if delivered.is_empty() {
                continue;
            }
            let registered = joins.iter().filter(|join| *join % batches.len() <= index).count();
            prop_assert_eq!(delivered.len(), registered);
            let first = &delivered[0].2;
            prop_assert!(delivered.iter().all(|(_, _, rows)| Arc::ptr_eq(rows, first)));
        }
        prop_assert_eq!(as_map(&shape.current_value()), replay(&log));
        drop(subscriptions);
    }
}
