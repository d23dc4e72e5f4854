//! The log-tailing stream.
//!
//! A [`ShapeStream`] repeatedly requests a shape's log from the server,
//! starting at its current `(offset, handle)` position. Every successful
//! response is decoded into an ordered batch of messages, the position is
//! advanced from the response headers, and the batch is published to all
//! subscribers before the next request is issued.
//!
//! ## Request loop
//!
//! 1. Catch-up requests read the log until the server reports up-to-date.
//! 2. With `subscribe` on, further requests carry `live=true` and are held
//!    open by the server until new changes exist.
//! 3. A 409 response or a `must-refetch` message resets the position to the
//!    start of the log under the new handle.
//!
//! Transient failures are retried with backoff. Failures that escape the
//! retry policy are reported to subscribers' error callbacks; the stream then
//! halts unless the configured error handler asks it to resume.

use crate::config::{
    LogMode, OptionsHash, Replica, RetryOverride, ShapeStreamOptions, MAX_RETRY_AFTER,
};
use crate::error::{ShapeError, ShapeResult};
use crate::http::{HttpClient, HttpResponse, ReqwestClient};
use crate::resume::ResumeState;
use crate::signal::AbortSignal;
use crate::source::{ShapeSource, Subscriber, SubscriberList, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shapesync_protocol::constants::{
    where_param_key, COLUMNS_PARAM, CURSOR_HEADER, CURSOR_PARAM, HANDLE_HEADER, HANDLE_PARAM,
    LIVE_PARAM, LOG_PARAM, OFFSET_HEADER, OFFSET_PARAM, REPLICA_PARAM, REQUIRED_HEADERS,
    RETRY_AFTER_HEADER, SCHEMA_HEADER, TABLE_PARAM, UP_TO_DATE_HEADER, WHERE_PARAM,
};
use shapesync_protocol::{
    parse_messages, parse_schema, ControlMessage, Message, Offset, Schema, ShapeHandle,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of the request loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The loop has not been started.
    Idle,
    /// The loop is running.
    Running,
    /// The loop ended (caught up without `subscribe`, halted, or aborted).
    Finished,
}

#[derive(Debug, Clone, Default)]
struct StreamState {
    offset: Offset,
    handle: Option<ShapeHandle>,
    schema: Option<Schema>,
    cursor: Option<String>,
    up_to_date: bool,
    has_synced: bool,
    last_synced_at: Option<DateTime<Utc>>,
    connected: bool,
    error: Option<ShapeError>,
    override_params: BTreeMap<String, String>,
    override_headers: BTreeMap<String, String>,
}

struct StreamInner {
    id: u64,
    options: ShapeStreamOptions,
    hash: OptionsHash,
    client: Arc<dyn HttpClient>,
    signal: AbortSignal,
    state: RwLock<StreamState>,
    subscribers: SubscriberList<Subscriber>,
    run: watch::Sender<RunState>,
}

/// A resumable reader of one shape's log.
///
/// Cloning is cheap; clones share the same loop, position and subscribers.
#[derive(Clone)]
pub struct ShapeStream {
    inner: Arc<StreamInner>,
}

/// Sets the run state to `Finished` even if the loop future is dropped.
struct RunGuard<'a>(&'a watch::Sender<RunState>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(RunState::Finished);
    }
}

enum LoopExit {
    Done,
    Aborted,
    Failed(ShapeError),
}

impl ShapeStream {
    /// Creates a stream. Nothing is requested until the first subscription
    /// or an explicit [`start`](Self::start).
    pub fn new(options: ShapeStreamOptions) -> ShapeResult<Self> {
        let hash = options.options_hash();
        Self::with_hash(options, hash)
    }

    /// Creates a stream identified by `hash` instead of the hash of its
    /// options.
    pub fn with_hash(options: ShapeStreamOptions, hash: OptionsHash) -> ShapeResult<Self> {
        options.validate()?;

        let client = options
            .client
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestClient::new()));
        let signal = options
            .signal
            .as_ref()
            .map(AbortSignal::child)
            .unwrap_or_default();

        let mut state = StreamState::default();
        match (options.offset, &options.handle) {
            (Some(offset), handle) => {
                state.offset = offset;
                state.handle = handle.clone();
            }
            (None, Some(handle)) => state.handle = Some(handle.clone()),
            (None, None) => {
                if let (Some(store), Some(key)) = (&options.resume_store, &options.resume_key) {
                    if let Some(saved) = store.load(key) {
                        debug!("Resuming {} from {} at {}", key, saved.handle, saved.offset);
                        state.offset = saved.offset;
                        state.handle = Some(saved.handle);
                    }
                }
            }
        }

        let (run, _) = watch::channel(RunState::Idle);

        Ok(Self {
            inner: Arc::new(StreamInner {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                options,
                hash,
                client,
                signal,
                state: RwLock::new(state),
                subscribers: SubscriberList::new(),
                run,
            }),
        })
    }

    /// Process-unique id of this stream.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Options the stream was created with.
    pub fn options(&self) -> &ShapeStreamOptions {
        &self.inner.options
    }

    /// Column schema reported by the server, once known.
    pub fn schema(&self) -> Option<Schema> {
        self.inner.state.read().schema.clone()
    }

    /// Current lifecycle of the request loop.
    pub fn run_state(&self) -> RunState {
        *self.inner.run.borrow()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Fires the stream's abort signal.
    pub fn abort(&self) {
        self.inner.signal.abort();
    }

    /// Returns true if both handles refer to the same stream.
    pub fn ptr_eq(&self, other: &ShapeStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs the request loop until it ends.
    ///
    /// Idempotent: if the loop is already running (or has finished), this
    /// waits for it to finish instead of starting another one. Returns the
    /// terminal error if the stream halted on one; an abort is not an error.
    pub async fn start(&self) -> ShapeResult<()> {
        let mut run = self.inner.run.subscribe();
        let claimed = self.inner.run.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });

        if claimed {
            let _guard = RunGuard(&self.inner.run);
            self.run_loop().await;
        } else {
            // the sender lives in `inner`, so the channel cannot close here
            let _ = run.wait_for(|state| *state == RunState::Finished).await;
        }

        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_started(&self) {
        if self.run_state() != RunState::Idle {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let stream = self.clone();
            runtime.spawn(async move {
                let _ = stream.start().await;
            });
        }
    }

    async fn run_loop(&self) {
        info!("Shape stream {} started for {}", self.inner.id, self.describe());
        let signal = self.inner.signal.clone();

        loop {
            let exit = tokio::select! {
                biased;
                _ = signal.aborted() => LoopExit::Aborted,
                result = self.follow_log() => match result {
                    Ok(()) => LoopExit::Done,
                    Err(err) => LoopExit::Failed(err),
                },
            };

            match exit {
                LoopExit::Done => {
                    debug!("Shape stream {} caught up, not subscribed", self.inner.id);
                    break;
                }
                LoopExit::Aborted => {
                    debug!("Shape stream {} aborted", self.inner.id);
                    break;
                }
                LoopExit::Failed(_) if signal.is_aborted() => break,
                LoopExit::Failed(err) => {
                    if !self.recover(err) {
                        break;
                    }
                }
            }
        }

        self.inner.state.write().connected = false;
    }

    /// Reports a terminal error; returns true if the loop should resume.
    fn recover(&self, err: ShapeError) -> bool {
        warn!("Shape stream {} failed: {}", self.inner.id, err);
        {
            let mut state = self.inner.state.write();
            state.error = Some(err.clone());
            state.connected = false;
        }

        for subscriber in self.inner.subscribers.snapshot() {
            if let Some(on_error) = &subscriber.on_error {
                on_error(&err);
            }
        }

        let retry = self
            .inner
            .options
            .on_error
            .as_ref()
            .and_then(|handler| handler(&err));

        match retry {
            Some(RetryOverride { params, headers }) => {
                info!("Shape stream {} resuming after error", self.inner.id);
                let mut state = self.inner.state.write();
                state.error = None;
                state.override_params.extend(params);
                state.override_headers.extend(headers);
                true
            }
            None => false,
        }
    }

    async fn follow_log(&self) -> ShapeResult<()> {
        loop {
            let url = self.request_url()?;
            let headers = self.request_headers();
            let response = self.fetch_with_backoff(&url, &headers).await?;

            if response.status == 409 {
                self.handle_conflict(&response);
                continue;
            }

            if self.process_response(&url, response)? {
                return Ok(());
            }
        }
    }

    fn request_url(&self) -> ShapeResult<String> {
        let options = &self.inner.options;
        let state = self.inner.state.read();

        let mut url = Url::parse(&options.url)
            .map_err(|e| ShapeError::InvalidOptions(format!("invalid url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(table) = &options.table {
                query.append_pair(TABLE_PARAM, table);
            }
            if let Some(where_clause) = &options.where_clause {
                query.append_pair(WHERE_PARAM, where_clause);
            }
            if !options.columns.is_empty() {
                query.append_pair(COLUMNS_PARAM, &options.columns.join(","));
            }
            for (position, value) in &options.params {
                query.append_pair(&where_param_key(position), value);
            }
            if options.replica == Replica::Full {
                query.append_pair(REPLICA_PARAM, "full");
            }
            if options.log == LogMode::ChangesOnly {
                query.append_pair(LOG_PARAM, "changes_only");
            }

            let mut extra = options.extra_params.clone();
            extra.extend(state.override_params.clone());
            for (name, value) in &extra {
                query.append_pair(name, value);
            }

            query.append_pair(OFFSET_PARAM, &state.offset.to_string());
            if let Some(handle) = &state.handle {
                query.append_pair(HANDLE_PARAM, handle.as_str());
            }
            if state.up_to_date && options.subscribe {
                query.append_pair(LIVE_PARAM, "true");
                if let Some(cursor) = &state.cursor {
                    query.append_pair(CURSOR_PARAM, cursor);
                }
            }
        }
        Ok(url.to_string())
    }

    fn request_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.inner.options.headers.clone();
        headers.extend(self.inner.state.read().override_headers.clone());
        headers
    }

    async fn fetch_with_backoff(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> ShapeResult<HttpResponse> {
        let retry = &self.inner.options.retry;
        let mut attempts = 0u32;

        loop {
            debug!("Shape stream {} requesting {}", self.inner.id, url);
            let err = match self.inner.client.get(url, headers).await {
                Ok(response) if response.is_success() || response.status == 409 => {
                    self.inner.state.write().connected = true;
                    return Ok(response);
                }
                Ok(response) => http_error(url, &response),
                Err(message) => ShapeError::transport_retryable(message),
            };

            self.inner.state.write().connected = false;
            attempts += 1;
            if !err.is_retryable() || !retry.allows_attempt(attempts) {
                return Err(err);
            }

            let delay = retry.delay_with_hint(attempts, err.retry_after());
            warn!(
                "Shape stream {} request failed ({}), retry {} in {:?}",
                self.inner.id, err, attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Handles a 409: the handle is gone and the log must be reread.
    fn handle_conflict(&self, response: &HttpResponse) {
        let new_handle = {
            let state = self.inner.state.read();
            response
                .header(HANDLE_HEADER)
                .map(ShapeHandle::from)
                .or_else(|| state.handle.as_ref().map(ShapeHandle::successor))
        };
        info!(
            "Shape stream {} handle invalidated, refetching under {:?}",
            self.inner.id, new_handle
        );

        let mut messages =
            match parse_messages(&response.body, &Schema::new(), &self.inner.options.parser) {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(
                        "Shape stream {} ignoring unreadable 409 body: {}",
                        self.inner.id, err
                    );
                    Vec::new()
                }
            };
        if !messages.iter().any(Message::is_must_refetch) {
            messages.push(Message::Control(ControlMessage::must_refetch()));
        }

        self.reset(new_handle);
        self.publish(&messages);
    }

    fn reset(&self, handle: Option<ShapeHandle>) {
        {
            let mut state = self.inner.state.write();
            state.offset = Offset::Initial;
            state.handle = handle;
            state.cursor = None;
            state.schema = None;
            state.up_to_date = false;
        }
        if let (Some(store), Some(key)) = (&self.inner.options.resume_store, &self.inner.options.resume_key) {
            store.clear(key);
        }
    }

    /// Applies a successful response; returns true when the loop is done.
    fn process_response(&self, url: &str, response: HttpResponse) -> ShapeResult<bool> {
        let missing: Vec<String> = REQUIRED_HEADERS
            .iter()
            .filter(|name| response.header(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ShapeError::MissingHeaders {
                url: url.to_string(),
                headers: missing,
            });
        }

        let handle = ShapeHandle::from(response.header(HANDLE_HEADER).unwrap_or_default());
        let offset: Offset = response.header(OFFSET_HEADER).unwrap_or_default().parse()?;
        let new_schema = response.header(SCHEMA_HEADER).map(parse_schema).transpose()?;
        let schema = match &new_schema {
            Some(schema) => schema.clone(),
            None => self.inner.state.read().schema.clone().unwrap_or_default(),
        };

        let mut messages = parse_messages(&response.body, &schema, &self.inner.options.parser)?;

        if let Some(position) = messages.iter().position(Message::is_must_refetch) {
            info!("Shape stream {} received must-refetch", self.inner.id);
            messages.truncate(position + 1);
            self.reset(None);
            self.publish(&messages);
            return Ok(false);
        }

        let header_up_to_date = response.header(UP_TO_DATE_HEADER).is_some();
        let up_to_date = header_up_to_date || messages.iter().any(Message::is_up_to_date);
        if header_up_to_date && !messages.iter().any(Message::is_up_to_date) {
            messages.push(Message::Control(ControlMessage::up_to_date()));
        }

        let resume = {
            let mut state = self.inner.state.write();
            let same_handle = state.handle.as_ref() == Some(&handle);
            if same_handle && offset.is_before(&state.offset) {
                warn!(
                    "Shape stream {} offset went back from {} to {}, keeping {}",
                    self.inner.id, state.offset, offset, state.offset
                );
            } else {
                state.offset = offset;
            }
            state.handle = Some(handle.clone());
            if state.schema.is_none() {
                state.schema = new_schema;
            }
            if let Some(cursor) = response.header(CURSOR_HEADER) {
                state.cursor = Some(cursor.to_string());
            }
            state.error = None;
            if up_to_date {
                state.up_to_date = true;
                state.has_synced = true;
                state.last_synced_at = Some(Utc::now());
            }
            up_to_date.then(|| ResumeState {
                offset: state.offset,
                handle,
            })
        };

        if let (Some(resume), Some(store), Some(key)) = (
            resume,
            &self.inner.options.resume_store,
            &self.inner.options.resume_key,
        ) {
            store.save(key, &resume);
        }

        if !messages.is_empty() {
            debug!(
                "Shape stream {} publishing {} messages",
                self.inner.id,
                messages.len()
            );
            self.publish(&messages);
        }

        Ok(up_to_date && !self.inner.options.subscribe)
    }

    fn publish(&self, messages: &[Message]) {
        if self.inner.signal.is_aborted() {
            return;
        }
        for subscriber in self.inner.subscribers.snapshot() {
            (subscriber.on_messages)(messages);
        }
    }

    fn describe(&self) -> String {
        let options = &self.inner.options;
        match &options.table {
            Some(table) => format!("{} (table {})", options.url, table),
            None => options.url.clone(),
        }
    }
}

impl ShapeSource for ShapeStream {
    fn subscribe_with(&self, subscriber: Subscriber) -> Subscription {
        let id = self.inner.subscribers.insert(subscriber);
        self.ensure_started();

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.subscribers.remove(id) == Some(0) && inner.options.abort_when_idle {
                debug!("Shape stream {} has no subscribers left, aborting", inner.id);
                inner.signal.abort();
            }
        })
    }

    fn last_offset(&self) -> Offset {
        self.inner.state.read().offset
    }

    fn shape_handle(&self) -> Option<ShapeHandle> {
        self.inner.state.read().handle.clone()
    }

    fn is_up_to_date(&self) -> bool {
        self.inner.state.read().up_to_date
    }

    fn is_loading(&self) -> bool {
        !self.inner.state.read().has_synced
    }

    fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().last_synced_at
    }

    fn error(&self) -> Option<ShapeError> {
        self.inner.state.read().error.clone()
    }

    fn signal(&self) -> AbortSignal {
        self.inner.signal.clone()
    }

    fn options_hash(&self) -> OptionsHash {
        self.inner.hash.clone()
    }

    fn log_mode(&self) -> LogMode {
        self.inner.options.log
    }

    fn table(&self) -> Option<String> {
        self.inner.options.table.clone()
    }

    fn aborts_when_idle(&self) -> bool {
        self.inner.options.abort_when_idle
    }
}

impl fmt::Debug for ShapeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ShapeStream")
            .field("id", &self.inner.id)
            .field("url", &self.inner.options.url)
            .field("table", &self.inner.options.table)
            .field("offset", &state.offset)
            .field("handle", &state.handle)
            .field("up_to_date", &state.up_to_date)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}

fn http_error(url: &str, response: &HttpResponse) -> ShapeError {
    let message = if response.body.trim().is_empty() {
        format!("HTTP {}", response.status)
    } else {
        response.body.clone()
    };
    ShapeError::Http {
        status: response.status,
        message,
        url: url.to_string(),
        retry_after: response
            .header(RETRY_AFTER_HEADER)
            .and_then(|raw| parse_retry_after(raw, Utc::now())),
    }
}

/// Parses a `Retry-After` value given in seconds or as an HTTP date.
pub(crate) fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    let delay = match raw.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
            (at - now).to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::http::{LoopbackClient, LoopbackServer};
    use crate::resume::{MemoryResumeStore, ResumeStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shapesync_protocol::{ChangeMessage, Operation};
    use std::collections::VecDeque;

    /// Replies with a fixed script of responses and records every request.
    #[derive(Default)]
    struct ScriptedServer {
        replies: Mutex<VecDeque<Result<HttpResponse, String>>>,
        requests: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    impl ScriptedServer {
        fn new(replies: Vec<Result<HttpResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl LoopbackServer for ScriptedServer {
        async fn handle_get(
            &self,
            path_and_query: &str,
            headers: &BTreeMap<String, String>,
        ) -> Result<HttpResponse, String> {
            self.requests
                .lock()
                .push((path_and_query.to_string(), headers.clone()));
            let next = self.replies.lock().pop_front();
            match next {
                Some(reply) => reply,
                // park like a long-poll with nothing new
                None => std::future::pending().await,
            }
        }
    }

    fn ok(handle: &str, offset: &str, body: &str) -> Result<HttpResponse, String> {
        Ok(HttpResponse::new(200)
            .with_header(HANDLE_HEADER, handle)
            .with_header(OFFSET_HEADER, offset)
            .with_header(SCHEMA_HEADER, r#"{"id":{"type":"int4"}}"#)
            .with_body(body))
    }

    fn up_to_date(handle: &str, offset: &str, body: &str) -> Result<HttpResponse, String> {
        ok(handle, offset, body).map(|r| r.with_header(UP_TO_DATE_HEADER, ""))
    }

    fn insert(id: u32) -> String {
        format!(
            r#"{{"key":"k{id}","value":{{"id":"{id}"}},"headers":{{"operation":"insert"}}}}"#
        )
    }

    fn options(server: &Arc<ScriptedServer>) -> ShapeStreamOptions {
        ShapeStreamOptions::new("http://localhost:3000/v1/shape")
            .with_table("todos")
            .with_client(Arc::new(LoopbackClient::new(Arc::clone(server))))
            .with_retry(
                RetryConfig::new()
                    .with_initial_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(5)),
            )
    }

    fn collect(stream: &ShapeStream) -> (Arc<Mutex<Vec<Message>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = stream.subscribe(move |batch| sink.lock().extend_from_slice(batch));
        (seen, subscription)
    }

    #[tokio::test]
    async fn catch_up_without_subscribe() {
        let server = ScriptedServer::new(vec![
            ok("h1", "0_0", &format!("[{}]", insert(1))),
            up_to_date("h1", "1_0", &format!("[{}]", insert(2))),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        assert!(stream.is_loading());

        let (seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].as_change().unwrap().value["id"], serde_json::json!(1));
        assert!(seen[2].is_up_to_date());

        assert!(!stream.is_loading());
        assert!(stream.is_up_to_date());
        assert_eq!(stream.last_offset(), Offset::log(1, 0));
        assert_eq!(stream.shape_handle(), Some(ShapeHandle::new("h1")));
        assert!(stream.last_synced_at().is_some());
        assert_eq!(stream.run_state(), RunState::Finished);

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("table=todos"));
        assert!(requests[0].contains("offset=-1"));
        assert!(!requests[0].contains("handle="));
        assert!(requests[1].contains("offset=0_0"));
        assert!(requests[1].contains("handle=h1"));
        assert!(!requests[1].contains("live="));
    }

    #[tokio::test]
    async fn live_requests_after_up_to_date() {
        let server = ScriptedServer::new(vec![
            up_to_date("h1", "0_0", "[]").map(|r| r.with_header(CURSOR_HEADER, "c7")),
            up_to_date("h1", "2_0", &format!("[{}]", insert(3))),
        ]);
        let stream = ShapeStream::new(options(&server)).unwrap();
        let (seen, subscription) = collect(&stream);

        for _ in 0..200 {
            if seen.lock().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let requests = server.requests();
        assert!(requests[1].contains("live=true"));
        assert!(requests[1].contains("cursor=c7"));
        assert_eq!(stream.last_offset(), Offset::log(2, 0));

        subscription.unsubscribe();
        assert!(stream.signal().is_aborted());
    }

    #[tokio::test]
    async fn conflict_resets_to_new_handle() {
        let server = ScriptedServer::new(vec![
            ok("h1", "0_0", &format!("[{}]", insert(1))),
            Ok(HttpResponse::new(409)
                .with_header(HANDLE_HEADER, "h2")
                .with_body(r#"[{"headers":{"control":"must-refetch"}}]"#)),
            up_to_date("h2", "5_0", &format!("[{}]", insert(2))),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        let seen = seen.lock();
        assert!(seen[1].is_must_refetch());
        assert_eq!(seen[2].as_change().unwrap().key, "k2");

        let requests = server.requests();
        assert!(requests[2].contains("offset=-1"));
        assert!(requests[2].contains("handle=h2"));
        assert_eq!(stream.shape_handle(), Some(ShapeHandle::new("h2")));
    }

    #[tokio::test]
    async fn conflict_without_handle_uses_successor() {
        let server = ScriptedServer::new(vec![
            ok("h1", "0_0", "[]"),
            Ok(HttpResponse::new(409)),
            up_to_date("h1-next", "0_0", "[]"),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        assert!(seen.lock()[0].is_must_refetch());
        assert!(server.requests()[2].contains("handle=h1-next"));
    }

    #[tokio::test]
    async fn conflict_with_unreadable_body_still_refetches() {
        let server = ScriptedServer::new(vec![
            ok("h1", "0_0", &format!("[{}]", insert(1))),
            Ok(HttpResponse::new(409)
                .with_header(HANDLE_HEADER, "h2")
                .with_body("<html>conflict</html>")),
            up_to_date("h2", "0_0", "[]"),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].is_must_refetch());
        assert!(server.requests()[2].contains("handle=h2"));
    }

    #[tokio::test]
    async fn must_refetch_in_body_drops_handle() {
        let server = ScriptedServer::new(vec![
            ok("h1", "3_0", r#"[{"headers":{"control":"must-refetch"}}]"#),
            up_to_date("h9", "0_0", "[]"),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (_seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        let requests = server.requests();
        assert!(requests[1].contains("offset=-1"));
        assert!(!requests[1].contains("handle="));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = ScriptedServer::new(vec![
            Err("connection reset".into()),
            Ok(HttpResponse::new(503)),
            Ok(HttpResponse::new(429).with_header(RETRY_AFTER_HEADER, "0")),
            up_to_date("h1", "0_0", "[]"),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _subscription =
            stream.subscribe_with_error(|_| {}, move |e| sink.lock().push(e.clone()));

        stream.start().await.unwrap();
        assert!(errors.lock().is_empty());
        assert_eq!(server.requests().len(), 4);
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn client_errors_halt_the_stream() {
        let server = ScriptedServer::new(vec![Ok(HttpResponse::new(401).with_body("denied"))]);
        let stream = ShapeStream::new(options(&server)).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _subscription =
            stream.subscribe_with_error(|_| {}, move |e| sink.lock().push(e.clone()));

        let err = stream.start().await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(stream.error(), Some(err));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_halt_the_stream() {
        let server = ScriptedServer::new(vec![
            Ok(HttpResponse::new(500)),
            Ok(HttpResponse::new(500)),
            Ok(HttpResponse::new(500)),
        ]);
        let stream = ShapeStream::new(
            options(&server).with_retry(
                RetryConfig::new()
                    .with_max_attempts(2)
                    .with_initial_delay(Duration::from_millis(1)),
            ),
        )
        .unwrap();
        let err = stream.start().await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn error_handler_resumes_with_new_headers() {
        let server = ScriptedServer::new(vec![
            Ok(HttpResponse::new(403)),
            up_to_date("h1", "0_0", "[]"),
        ]);
        let stream = ShapeStream::new(
            options(&server)
                .with_subscribe(false)
                .with_header("authorization", "old")
                .with_error_handler(|err| {
                    (err.status() == Some(403))
                        .then(|| RetryOverride::new().with_header("Authorization", "new"))
                }),
        )
        .unwrap();

        stream.start().await.unwrap();
        let requests = server.requests.lock();
        assert_eq!(requests[0].1["authorization"], "old");
        assert_eq!(requests[1].1["authorization"], "new");
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn missing_headers_are_terminal() {
        let server = ScriptedServer::new(vec![Ok(HttpResponse::new(200).with_body("[]"))]);
        let stream = ShapeStream::new(options(&server)).unwrap();
        let err = stream.start().await.unwrap_err();
        assert!(matches!(err, ShapeError::MissingHeaders { ref headers, .. } if headers.len() == 2));
    }

    #[tokio::test]
    async fn offset_never_moves_backwards() {
        let server = ScriptedServer::new(vec![
            ok("h1", "5_0", "[]"),
            up_to_date("h1", "4_0", "[]"),
        ]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        stream.start().await.unwrap();
        assert_eq!(stream.last_offset(), Offset::log(5, 0));
    }

    #[tokio::test]
    async fn abort_stops_the_loop() {
        let server = ScriptedServer::new(vec![up_to_date("h1", "0_0", "[]")]);
        let signal = AbortSignal::new();
        let stream = ShapeStream::new(options(&server).with_signal(signal.clone())).unwrap();

        let runner = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.start().await })
        };
        for _ in 0..200 {
            if server.requests().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        signal.abort();

        runner.await.unwrap().unwrap();
        assert_eq!(stream.run_state(), RunState::Finished);
        assert!(!stream.is_connected());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let server = ScriptedServer::new(vec![up_to_date("h1", "0_0", "[]")]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (a, b) = tokio::join!(stream.start(), stream.start());
        a.unwrap();
        b.unwrap();
        stream.start().await.unwrap();
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn resume_store_is_read_and_written() {
        let store = Arc::new(MemoryResumeStore::new());
        store.save(
            "todos",
            &ResumeState {
                offset: Offset::log(7, 1),
                handle: ShapeHandle::new("h1"),
            },
        );
        let server = ScriptedServer::new(vec![up_to_date("h1", "8_0", "[]")]);
        let stream = ShapeStream::new(
            options(&server)
                .with_subscribe(false)
                .with_resume_store(store.clone(), "todos"),
        )
        .unwrap();
        stream.start().await.unwrap();

        assert!(server.requests()[0].contains("offset=7_1"));
        assert_eq!(store.load("todos").unwrap().offset, Offset::log(8, 0));
    }

    #[tokio::test]
    async fn request_parameters() {
        let server = ScriptedServer::new(vec![up_to_date("h1", "0_0", "[]")]);
        let stream = ShapeStream::new(
            options(&server)
                .with_subscribe(false)
                .with_where("id > $1")
                .with_params(["3"])
                .with_columns(["id", "title"])
                .with_replica(Replica::Full)
                .with_log_mode(LogMode::ChangesOnly)
                .with_extra_param("source_id", "abc"),
        )
        .unwrap();
        stream.start().await.unwrap();

        let request = &server.requests()[0];
        let parsed = Url::parse(&format!("http://localhost{}", request)).unwrap();
        let pairs: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["where"], "id > $1");
        assert_eq!(pairs["params[1]"], "3");
        assert_eq!(pairs["columns"], "id,title");
        assert_eq!(pairs["replica"], "full");
        assert_eq!(pairs["log"], "changes_only");
        assert_eq!(pairs["source_id"], "abc");
    }

    #[tokio::test]
    async fn values_are_parsed_with_schema() {
        let server = ScriptedServer::new(vec![up_to_date("h1", "0_0", &format!("[{}]", insert(4)))]);
        let stream = ShapeStream::new(options(&server).with_subscribe(false)).unwrap();
        let (seen, _subscription) = collect(&stream);
        stream.start().await.unwrap();

        let seen = seen.lock();
        let change: &ChangeMessage = seen[0].as_change().unwrap();
        assert_eq!(change.operation, Operation::Insert);
        assert_eq!(change.value["id"], serde_json::json!(4));
        assert!(stream.schema().unwrap().contains_key("id"));
    }

    #[test]
    fn retry_after_formats() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("3", now), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("999999", now), Some(MAX_RETRY_AFTER));
        let later = (now + chrono::Duration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&later, now).unwrap();
        assert!(parsed <= Duration::from_secs(30) && parsed >= Duration::from_secs(29));
        let past = (now - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past, now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }
}
