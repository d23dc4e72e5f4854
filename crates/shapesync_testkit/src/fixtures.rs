//! Ready-made tables, servers and stream options.

use crate::config::ServerConfig;
use crate::server::ShapeLogServer;
use crate::table::TableDef;
use serde_json::{json, Value};
use shapesync_client::{HttpClient, LoopbackClient, RetryConfig, ShapeStreamOptions};
use shapesync_protocol::ColumnInfo;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Base URL used for loopback requests.
pub const SHAPE_URL: &str = "http://localhost:3000/v1/shape";

/// Name of the table created by [`todos_server`].
pub const TODOS: &str = "todos";

/// `todos(id text primary key, title text, done bool)`.
pub fn todos_table() -> TableDef {
    TableDef::new(TODOS)
        .primary_key_column("id", "text")
        .column("title", ColumnInfo::new("text"))
        .column("done", ColumnInfo::new("bool"))
}

/// A server with an empty `todos` table and a short long-poll timeout.
pub fn todos_server() -> Arc<ShapeLogServer> {
    let server = ShapeLogServer::with_config(
        ServerConfig::new().with_long_poll_timeout(Duration::from_millis(200)),
    );
    // a fresh server has no tables, so this cannot collide
    let _ = server.create_table(todos_table());
    Arc::new(server)
}

/// A `todos` row that is not done.
pub fn todo(id: &str, title: &str) -> Value {
    json!({"id": id, "title": title, "done": false})
}

/// An HTTP client that routes to `server`.
pub fn loopback(server: &Arc<ShapeLogServer>) -> Arc<dyn HttpClient> {
    Arc::new(LoopbackClient::new(Arc::clone(server)))
}

/// Retries quickly and without jitter.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(10))
        .with_jitter(false)
}

/// Options for a stream over `table` on `server`.
pub fn stream_options(server: &Arc<ShapeLogServer>, table: &str) -> ShapeStreamOptions {
    ShapeStreamOptions::new(SHAPE_URL)
        .with_table(table)
        .with_client(loopback(server))
        .with_retry(fast_retry())
}

/// Polls `condition` until it holds or `timeout` passes; returns the last
/// result.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `future` with a timeout, failing the test if it does not finish.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    match tokio::time::timeout(timeout, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {:?}", timeout),
    }
}
