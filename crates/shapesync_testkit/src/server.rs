//! In-memory shape log server.
//!
//! Serves the shape log protocol for whole tables: `where` clauses are
//! recorded but not evaluated. Values are sent as text, keys look like
//! `"public"."todos"/"1"`, and every mutation is its own transaction.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::table::{LogEntry, TableDef, TableLog};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use shapesync_client::{HttpResponse, LoopbackServer};
use shapesync_protocol::constants::{
    COLUMNS_PARAM, CURSOR_HEADER, HANDLE_HEADER, HANDLE_PARAM, LIVE_PARAM, LOG_PARAM,
    OFFSET_HEADER, OFFSET_PARAM, SCHEMA_HEADER, TABLE_PARAM, UP_TO_DATE_HEADER,
};
use shapesync_protocol::{
    encode_messages, ChangeMessage, ControlMessage, Message, Offset, Row, Schema, ShapeHandle,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// A request as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Request path.
    pub path: String,
    /// Decoded query parameters.
    pub params: BTreeMap<String, String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
}

impl RecordedRequest {
    fn parse(path_and_query: &str, headers: &BTreeMap<String, String>) -> Self {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        Self {
            path: path.to_string(),
            params: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            headers: headers.clone(),
        }
    }

    /// Looks up a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Returns true for long-poll requests.
    pub fn is_live(&self) -> bool {
        self.param(LIVE_PARAM) == Some("true")
    }
}

#[derive(Default)]
struct ServerState {
    tables: HashMap<String, TableLog>,
    next_tx: u64,
}

impl ServerState {
    fn table_mut(&mut self, name: &str) -> ServerResult<&mut TableLog> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| ServerError::UnknownTable(name.to_string()))
    }

    fn next_tx(&mut self) -> u64 {
        self.next_tx += 1;
        self.next_tx
    }
}

/// A reference shape log server reachable through
/// [`LoopbackClient`](shapesync_client::LoopbackClient).
pub struct ShapeLogServer {
    config: ServerConfig,
    state: RwLock<ServerState>,
    changed: Notify,
    failures: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ShapeLogServer {
    /// Creates a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server with a custom configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ServerState::default()),
            changed: Notify::new(),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Adds a table.
    pub fn create_table(&self, def: TableDef) -> ServerResult<ShapeHandle> {
        let mut state = self.state.write();
        if state.tables.contains_key(&def.name) {
            return Err(ServerError::TableExists(def.name));
        }
        let handle = new_handle();
        let start = Offset::log(state.next_tx, 0);
        state
            .tables
            .insert(def.name.clone(), TableLog::new(def, handle.clone(), start));
        Ok(handle)
    }

    /// Inserts a row.
    pub fn insert(&self, table: &str, row: Value) -> ServerResult<Offset> {
        let row = into_row(row)?;
        self.mutate(table, |log, tx| log.insert(row, tx))
    }

    /// Updates the columns present in `changes`; the primary key selects the row.
    pub fn update(&self, table: &str, changes: Value) -> ServerResult<Offset> {
        let changes = into_row(changes)?;
        self.mutate(table, |log, tx| log.update(changes, tx))
    }

    /// Deletes the row with the primary key found in `row`.
    pub fn delete(&self, table: &str, row: Value) -> ServerResult<Offset> {
        let row = into_row(row)?;
        self.mutate(table, |log, tx| log.delete(row, tx))
    }

    /// Issues a new handle for `table`; requests under the old handle get 409.
    pub fn rotate(&self, table: &str) -> ServerResult<ShapeHandle> {
        let handle = new_handle();
        {
            let mut state = self.state.write();
            state.table_mut(table)?.rotate(handle.clone());
        }
        debug!("Rotated {} to handle {}", table, handle);
        self.changed.notify_waiters();
        Ok(handle)
    }

    fn mutate<F>(&self, table: &str, apply: F) -> ServerResult<Offset>
    where
        F: FnOnce(&mut TableLog, u64) -> ServerResult<Offset>,
    {
        let offset = {
            let mut state = self.state.write();
            state.table_mut(table)?;
            let tx = state.next_tx();
            apply(state.table_mut(table)?, tx)?
        };
        self.changed.notify_waiters();
        Ok(offset)
    }

    /// Current handle of `table`.
    pub fn handle(&self, table: &str) -> Option<ShapeHandle> {
        self.state.read().tables.get(table).map(|log| log.handle.clone())
    }

    /// Offset of the newest change in `table`.
    pub fn offset(&self, table: &str) -> Option<Offset> {
        self.state.read().tables.get(table).map(TableLog::offset)
    }

    /// Current rows of `table`, unencoded.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|log| log.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Log entries of `table` under its current handle.
    pub fn log(&self, table: &str) -> Vec<LogEntry> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Answers the next `times` requests with `status`.
    pub fn fail_next(&self, status: u16, times: usize) {
        self.failures
            .lock()
            .extend(std::iter::repeat(status).take(times));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    async fn respond(&self, request: &RecordedRequest) -> ServerResult<HttpResponse> {
        let deadline = Instant::now() + self.config.long_poll_timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(response) = self.poll(request)? {
                return Ok(response);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.poll_expired(request);
            }
        }
    }

    /// Builds a response, or returns `None` if a live request has to wait.
    fn poll(&self, request: &RecordedRequest) -> ServerResult<Option<HttpResponse>> {
        let state = self.state.read();
        let name = request
            .param(TABLE_PARAM)
            .ok_or(ServerError::MissingParam(TABLE_PARAM))?;
        let log = state
            .tables
            .get(name)
            .ok_or_else(|| ServerError::UnknownTable(name.to_string()))?;
        let offset: Offset = request
            .param(OFFSET_PARAM)
            .unwrap_or("-1")
            .parse()
            .map_err(|_| ServerError::InvalidOffset(request.param(OFFSET_PARAM).unwrap_or_default().into()))?;

        match request.param(HANDLE_PARAM).map(ShapeHandle::from) {
            Some(handle) if handle != log.handle => return Ok(Some(conflict(log))),
            None if !matches!(offset, Offset::Initial | Offset::Now) => {
                return Err(ServerError::HandleRequired)
            }
            _ => {}
        }

        let shape = ShapeView::new(log, request);
        match offset {
            Offset::Initial => {
                let changes = if request.param(LOG_PARAM) == Some("changes_only") {
                    Vec::new()
                } else {
                    log.snapshot()
                };
                Ok(Some(shape.response(changes, log.offset(), true)))
            }
            Offset::Now => Ok(Some(shape.response(Vec::new(), log.offset(), true))),
            Offset::Log { .. } => {
                let pending = log.since(offset);
                if pending.is_empty() && request.is_live() {
                    return Ok(None);
                }
                let batch = &pending[..pending.len().min(self.config.max_batch)];
                let up_to_date = batch.len() == pending.len();
                let next = batch.last().map(|entry| entry.offset).unwrap_or(offset);
                let changes = batch.iter().map(|entry| entry.change.clone()).collect();
                Ok(Some(shape.response(changes, next, up_to_date)))
            }
        }
    }

    fn poll_expired(&self, request: &RecordedRequest) -> ServerResult<HttpResponse> {
        let state = self.state.read();
        let name = request.param(TABLE_PARAM).unwrap_or_default();
        let log = state
            .tables
            .get(name)
            .ok_or_else(|| ServerError::UnknownTable(name.to_string()))?;
        let offset = request
            .param(OFFSET_PARAM)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| log.offset());
        Ok(ShapeView::new(log, request).response(Vec::new(), offset, true))
    }
}

impl Default for ShapeLogServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShapeLogServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ShapeLogServer")
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("next_tx", &state.next_tx)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LoopbackServer for ShapeLogServer {
    async fn handle_get(
        &self,
        path_and_query: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, String> {
        let request = RecordedRequest::parse(path_and_query, headers);
        self.requests.lock().push(request.clone());

        let injected = self.failures.lock().pop_front();
        if let Some(status) = injected {
            debug!("Injecting HTTP {} for {}", status, path_and_query);
            return Ok(HttpResponse::new(status).with_body("injected failure"));
        }

        match self.respond(&request).await {
            Ok(response) => Ok(response),
            Err(err) => Ok(HttpResponse::new(err.status()).with_body(err.to_string())),
        }
    }
}

/// The part of a table a request asked for.
struct ShapeView<'a> {
    log: &'a TableLog,
    columns: Option<Vec<String>>,
    live: bool,
}

impl<'a> ShapeView<'a> {
    fn new(log: &'a TableLog, request: &RecordedRequest) -> Self {
        let columns = request.param(COLUMNS_PARAM).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|column| !column.is_empty())
                .map(String::from)
                .collect()
        });
        Self {
            log,
            columns,
            live: request.is_live(),
        }
    }

    fn keeps(&self, column: &str) -> bool {
        match &self.columns {
            Some(columns) => {
                columns.iter().any(|c| c == column) || self.log.def.primary_key.iter().any(|c| c == column)
            }
            None => true,
        }
    }

    fn schema(&self) -> Schema {
        self.log
            .def
            .schema
            .iter()
            .filter(|(column, _)| self.keeps(column))
            .map(|(column, info)| (column.clone(), info.clone()))
            .collect()
    }

    fn project(&self, mut change: ChangeMessage) -> ChangeMessage {
        change.value.retain(|column, _| self.keeps(column));
        change
    }

    fn response(&self, changes: Vec<ChangeMessage>, offset: Offset, up_to_date: bool) -> HttpResponse {
        let mut messages: Vec<Message> = changes
            .into_iter()
            .map(|change| Message::Change(self.project(change)))
            .collect();
        if up_to_date {
            messages.push(Message::Control(ControlMessage::up_to_date()));
        }

        let mut response = HttpResponse::new(200)
            .with_header(HANDLE_HEADER, self.log.handle.as_str())
            .with_header(OFFSET_HEADER, offset.to_string())
            .with_body(encode_messages(&messages));
        if self.live {
            response = response.with_header(CURSOR_HEADER, offset.to_string());
        } else {
            let schema = serde_json::to_string(&self.schema()).unwrap_or_default();
            response = response.with_header(SCHEMA_HEADER, schema);
        }
        if up_to_date {
            response = response.with_header(UP_TO_DATE_HEADER, "");
        }
        response
    }
}

fn conflict(log: &TableLog) -> HttpResponse {
    HttpResponse::new(409)
        .with_header(HANDLE_HEADER, log.handle.as_str())
        .with_body(encode_messages(&[Message::Control(ControlMessage::must_refetch())]))
}

fn new_handle() -> ShapeHandle {
    ShapeHandle::new(Uuid::new_v4().simple().to_string())
}

fn into_row(value: Value) -> ServerResult<Row> {
    match value {
        Value::Object(row) => Ok(row),
        _ => Err(ServerError::InvalidRow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shapesync_protocol::{parse_messages, parse_schema, ColumnInfo, ValueParser};
    use std::sync::Arc;
    use std::time::Duration;

    fn server() -> ShapeLogServer {
        let server = ShapeLogServer::with_config(
            ServerConfig::new().with_long_poll_timeout(Duration::from_millis(50)),
        );
        server
            .create_table(
                TableDef::new("todos")
                    .primary_key_column("id", "int4")
                    .column("title", ColumnInfo::new("text"))
                    .column("done", ColumnInfo::new("bool")),
            )
            .unwrap();
        server
    }

    async fn get(server: &ShapeLogServer, query: &str) -> HttpResponse {
        server
            .handle_get(&format!("/v1/shape?{}", query), &BTreeMap::new())
            .await
            .unwrap()
    }

    fn messages(response: &HttpResponse) -> Vec<Message> {
        let schema = response
            .header(SCHEMA_HEADER)
            .map(|raw| parse_schema(raw).unwrap())
            .unwrap_or_default();
        parse_messages(&response.body, &schema, &ValueParser::new()).unwrap()
    }

    #[tokio::test]
    async fn initial_request_returns_snapshot() {
        let server = server();
        server.insert("todos", json!({"id": 1, "title": "a", "done": false})).unwrap();
        server.insert("todos", json!({"id": 2, "title": "b", "done": true})).unwrap();

        let response = get(&server, "table=todos&offset=-1").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header(OFFSET_HEADER), Some("2_0"));
        assert!(response.header(UP_TO_DATE_HEADER).is_some());

        let batch = messages(&response);
        assert_eq!(batch.len(), 3);
        let first = batch[0].as_change().unwrap();
        assert_eq!(first.key, "\"public\".\"todos\"/\"1\"");
        assert_eq!(first.value["id"], json!(1));
        assert_eq!(batch[1].as_change().unwrap().value["done"], json!(true));
        assert!(batch[2].is_up_to_date());
    }

    #[tokio::test]
    async fn log_requests_return_newer_entries() {
        let server = server();
        server.insert("todos", json!({"id": 1, "title": "a"})).unwrap();
        let handle = server.handle("todos").unwrap();
        server.update("todos", json!({"id": 1, "title": "b"})).unwrap();
        server.delete("todos", json!({"id": 1})).unwrap();

        let response = get(&server, &format!("table=todos&offset=1_0&handle={}", handle)).await;
        let batch = messages(&response);
        assert_eq!(batch.len(), 3);
        let update = batch[0].as_change().unwrap();
        assert_eq!(update.value, json!({"id": 1, "title": "b"}).as_object().cloned().unwrap());
        assert_eq!(update.txids(), vec![2]);
        assert_eq!(response.header(OFFSET_HEADER), Some("3_0"));
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let server = ShapeLogServer::with_config(ServerConfig::new().with_max_batch(2));
        server
            .create_table(TableDef::new("t").primary_key_column("id", "text"))
            .unwrap();
        let handle = server.handle("t").unwrap();
        for id in ["a", "b", "c"] {
            server.insert("t", json!({"id": id})).unwrap();
        }

        let response = get(&server, &format!("table=t&offset=0_0&handle={}", handle)).await;
        assert_eq!(messages(&response).len(), 2);
        assert!(response.header(UP_TO_DATE_HEADER).is_none());
        assert_eq!(response.header(OFFSET_HEADER), Some("2_0"));
    }

    #[tokio::test]
    async fn stale_handle_gets_conflict() {
        let server = server();
        let old = server.handle("todos").unwrap();
        let new = server.rotate("todos").unwrap();

        let response = get(&server, &format!("table=todos&offset=-1&handle={}", old)).await;
        assert_eq!(response.status, 409);
        assert_eq!(response.header(HANDLE_HEADER), Some(new.as_str()));
        assert!(messages(&response)[0].is_must_refetch());
    }

    #[tokio::test]
    async fn live_request_waits_for_changes() {
        let server = Arc::new(server());
        let handle = server.handle("todos").unwrap();
        let offset = server.offset("todos").unwrap();

        let pending = {
            let server = Arc::clone(&server);
            let query = format!("table=todos&offset={}&handle={}&live=true", offset, handle);
            tokio::spawn(async move { get(&server, &query).await })
        };
        tokio::task::yield_now().await;
        server.insert("todos", json!({"id": 9, "title": "late"})).unwrap();

        let response = pending.await.unwrap();
        let batch = messages(&response);
        assert_eq!(batch[0].as_change().unwrap().value["title"], json!("late"));
        assert!(response.header(CURSOR_HEADER).is_some());
    }

    #[tokio::test]
    async fn live_request_times_out_up_to_date() {
        let server = server();
        let handle = server.handle("todos").unwrap();
        let offset = server.offset("todos").unwrap();

        let response = get(
            &server,
            &format!("table=todos&offset={}&handle={}&live=true", offset, handle),
        )
        .await;
        assert_eq!(response.status, 200);
        let batch = messages(&response);
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is_up_to_date());
    }

    #[tokio::test]
    async fn columns_are_projected() {
        let server = server();
        server.insert("todos", json!({"id": 1, "title": "a", "done": true})).unwrap();

        let response = get(&server, "table=todos&offset=-1&columns=title").await;
        let schema = parse_schema(response.header(SCHEMA_HEADER).unwrap()).unwrap();
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["id", "title"]);
        let change = messages(&response)[0].as_change().cloned().unwrap();
        assert!(change.value.get("done").is_none());
    }

    #[tokio::test]
    async fn injected_failures_and_errors() {
        let server = server();
        server.fail_next(503, 1);
        assert_eq!(get(&server, "table=todos&offset=-1").await.status, 503);
        assert_eq!(get(&server, "table=todos&offset=-1").await.status, 200);
        assert_eq!(get(&server, "table=nope&offset=-1").await.status, 404);
        assert_eq!(get(&server, "table=todos&offset=1_0").await.status, 400);
        assert_eq!(server.request_count(), 4);
    }
}
