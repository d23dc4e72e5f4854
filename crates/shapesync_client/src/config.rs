//! Configuration for shape streams.

use crate::error::{ShapeError, ShapeResult};
use crate::http::HttpClient;
use crate::resume::ResumeStore;
use crate::signal::AbortSignal;
use rand::Rng;
use serde::{Deserialize, Serialize};
use shapesync_protocol::constants::RESERVED_PARAMS;
use shapesync_protocol::{Offset, ShapeHandle, ValueParser};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Upper bound applied to server `Retry-After` hints.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Row image sent on updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Replica {
    /// Updates carry the primary key and changed columns only.
    #[default]
    Default,
    /// Updates carry the full row plus `old_value`.
    Full,
}

/// Whether the stream starts with a snapshot of existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Initial snapshot followed by changes.
    #[default]
    Full,
    /// Changes only; rows that existed before the stream started are never sent.
    ChangesOnly,
}

/// Extra request parameters returned by an error handler to resume a halted stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOverride {
    /// Query parameters merged over the configured ones.
    pub params: BTreeMap<String, String>,
    /// Headers merged over the configured ones.
    pub headers: BTreeMap<String, String>,
}

impl RetryOverride {
    /// Creates an empty override (resume with unchanged options).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Decides whether a stream that hit a terminal error should resume.
pub type ErrorHandler = Arc<dyn Fn(&ShapeError) -> Option<RetryOverride> + Send + Sync>;

/// Normalized identity of a stream definition.
///
/// Equal for option sets that describe the same server-side shape, regardless
/// of the order in which parameters were added.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionsHash(String);

impl OptionsHash {
    /// Wraps a precomputed hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Returns the hash text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptionsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options for a [`ShapeStream`](crate::ShapeStream).
#[derive(Clone)]
pub struct ShapeStreamOptions {
    /// Shape endpoint, e.g. `http://localhost:3000/v1/shape`.
    pub url: String,
    /// Table, optionally schema-qualified.
    pub table: Option<String>,
    /// Row filter.
    pub where_clause: Option<String>,
    /// Projected columns; empty means all.
    pub columns: Vec<String>,
    /// Positional where-clause parameters, keyed by position.
    pub params: BTreeMap<String, String>,
    /// Additional query parameters passed through untouched.
    pub extra_params: BTreeMap<String, String>,
    /// Replica mode.
    pub replica: Replica,
    /// Log mode.
    pub log: LogMode,
    /// Static request headers (lowercase names).
    pub headers: BTreeMap<String, String>,
    /// Offset to start from; `None` means the beginning (or the resume store).
    pub offset: Option<Offset>,
    /// Handle the starting offset belongs to.
    pub handle: Option<ShapeHandle>,
    /// Keep long-polling after the first up-to-date.
    pub subscribe: bool,
    /// External abort signal.
    pub signal: Option<AbortSignal>,
    /// Column value decoders.
    pub parser: ValueParser,
    /// Backoff policy for transient failures.
    pub retry: RetryConfig,
    /// HTTP client; defaults to [`ReqwestClient`](crate::ReqwestClient).
    pub client: Option<Arc<dyn HttpClient>>,
    /// Where to load and save the resume position.
    pub resume_store: Option<Arc<dyn ResumeStore>>,
    /// Key under which the position is stored.
    pub resume_key: Option<String>,
    /// Handler consulted after a terminal error.
    pub on_error: Option<ErrorHandler>,
    /// Abort the stream once its last subscriber leaves.
    pub abort_when_idle: bool,
}

impl ShapeStreamOptions {
    /// Creates options for the given shape endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: None,
            where_clause: None,
            columns: Vec::new(),
            params: BTreeMap::new(),
            extra_params: BTreeMap::new(),
            replica: Replica::Default,
            log: LogMode::Full,
            headers: BTreeMap::new(),
            offset: None,
            handle: None,
            subscribe: true,
            signal: None,
            parser: ValueParser::new(),
            retry: RetryConfig::default(),
            client: None,
            resume_store: None,
            resume_key: None,
            on_error: None,
            abort_when_idle: true,
        }
    }

    /// Sets the table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the row filter.
    pub fn with_where(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    /// Sets the projected columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets one positional where-clause parameter (`$1` is position `"1"`).
    pub fn with_param(mut self, position: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(position.into(), value.into());
        self
    }

    /// Sets where-clause parameters from a list; the first value is `$1`.
    pub fn with_params<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (i, value) in values.into_iter().enumerate() {
            self.params.insert((i + 1).to_string(), value.into());
        }
        self
    }

    /// Adds a pass-through query parameter.
    pub fn with_extra_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(name.into(), value.into());
        self
    }

    /// Sets the replica mode.
    pub fn with_replica(mut self, replica: Replica) -> Self {
        self.replica = replica;
        self
    }

    /// Sets the log mode.
    pub fn with_log_mode(mut self, log: LogMode) -> Self {
        self.log = log;
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the starting offset.
    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the handle of the starting offset.
    pub fn with_handle(mut self, handle: impl Into<ShapeHandle>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Sets whether to keep following the log after catching up.
    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    /// Sets the abort signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Sets the value parser.
    pub fn with_parser(mut self, parser: ValueParser) -> Self {
        self.parser = parser;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the HTTP client.
    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Persists the stream position in `store` under `key`.
    pub fn with_resume_store(mut self, store: Arc<dyn ResumeStore>, key: impl Into<String>) -> Self {
        self.resume_store = Some(store);
        self.resume_key = Some(key.into());
        self
    }

    /// Sets the terminal error handler.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ShapeError) -> Option<RetryOverride> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Sets whether the stream aborts itself when its last subscriber leaves.
    pub fn with_abort_when_idle(mut self, abort_when_idle: bool) -> Self {
        self.abort_when_idle = abort_when_idle;
        self
    }

    /// Checks the options before any request is made.
    pub fn validate(&self) -> ShapeResult<()> {
        Url::parse(&self.url)
            .map_err(|e| ShapeError::InvalidOptions(format!("invalid url {:?}: {}", self.url, e)))?;

        if let Some(name) = self
            .extra_params
            .keys()
            .find(|name| RESERVED_PARAMS.contains(&name.as_str()))
        {
            return Err(ShapeError::InvalidOptions(format!(
                "query parameter {:?} is reserved",
                name
            )));
        }

        if self.offset.is_some_and(|o| !o.is_initial() && o != Offset::Now) && self.handle.is_none() {
            return Err(ShapeError::InvalidOptions(
                "a handle is required when resuming from a log offset".into(),
            ));
        }

        if self.resume_store.is_some() != self.resume_key.is_some() {
            return Err(ShapeError::InvalidOptions(
                "resume store and key must be set together".into(),
            ));
        }

        Ok(())
    }

    /// Computes the normalized identity of these options.
    ///
    /// Covers every option that affects which shape the server returns or how
    /// rows are decoded. The starting position, abort signal, retry policy and
    /// callbacks are excluded.
    pub fn options_hash(&self) -> OptionsHash {
        #[derive(Serialize)]
        struct Identity<'a> {
            url: &'a str,
            table: &'a Option<String>,
            #[serde(rename = "where")]
            where_clause: &'a Option<String>,
            columns: &'a [String],
            params: &'a BTreeMap<String, String>,
            extra_params: &'a BTreeMap<String, String>,
            replica: Replica,
            log: LogMode,
            headers: &'a BTreeMap<String, String>,
            subscribe: bool,
            custom_types: Vec<&'a str>,
        }

        let identity = Identity {
            url: &self.url,
            table: &self.table,
            where_clause: &self.where_clause,
            columns: &self.columns,
            params: &self.params,
            extra_params: &self.extra_params,
            replica: self.replica,
            log: self.log,
            headers: &self.headers,
            subscribe: self.subscribe,
            custom_types: self.parser.custom_types().collect(),
        };
        // serializing borrowed strings and sorted maps cannot fail
        OptionsHash(serde_json::to_string(&identity).unwrap_or_default())
    }
}

impl fmt::Debug for ShapeStreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeStreamOptions")
            .field("url", &self.url)
            .field("table", &self.table)
            .field("where_clause", &self.where_clause)
            .field("columns", &self.columns)
            .field("params", &self.params)
            .field("extra_params", &self.extra_params)
            .field("replica", &self.replica)
            .field("log", &self.log)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("offset", &self.offset)
            .field("handle", &self.handle)
            .field("subscribe", &self.subscribe)
            .field("parser", &self.parser)
            .field("retry", &self.retry)
            .field("resume_key", &self.resume_key)
            .field("abort_when_idle", &self.abort_when_idle)
            .finish_non_exhaustive()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per request; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to randomize delays (full jitter).
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates the default configuration: unlimited attempts starting at
    /// 100 ms, growing by 1.3x up to 60 s, with full jitter.
    pub fn new() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.3,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt may follow `attempts` failed ones.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter && delay_secs > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=delay_secs))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Delay before `attempt`, raised to the server's `Retry-After` hint.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match retry_after {
            Some(hint) => delay.max(hint.min(MAX_RETRY_AFTER)),
            None => delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
