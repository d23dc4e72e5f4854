//! Header and query parameter names of the shape HTTP protocol.

/// Response header carrying the shape handle.
pub const HANDLE_HEADER: &str = "electric-handle";
/// Response header carrying the offset of the last message in the body.
pub const OFFSET_HEADER: &str = "electric-offset";
/// Response header carrying the JSON column schema.
pub const SCHEMA_HEADER: &str = "electric-schema";
/// Response header carrying the live-request cache-busting cursor.
pub const CURSOR_HEADER: &str = "electric-cursor";
/// Response header present when the response brings the client up to date.
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";
/// Standard retry hint header on 429 and 503 responses.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Headers a successful shape response must carry.
pub const REQUIRED_HEADERS: [&str; 2] = [HANDLE_HEADER, OFFSET_HEADER];

/// Table (possibly schema-qualified) the shape is defined on.
pub const TABLE_PARAM: &str = "table";
/// Row filter expression.
pub const WHERE_PARAM: &str = "where";
/// Comma separated column list.
pub const COLUMNS_PARAM: &str = "columns";
/// Replica mode (`full` sends complete rows on update).
pub const REPLICA_PARAM: &str = "replica";
/// Log mode (`changes_only` skips the initial snapshot).
pub const LOG_PARAM: &str = "log";
/// Offset to read from.
pub const OFFSET_PARAM: &str = "offset";
/// Handle the offset belongs to.
pub const HANDLE_PARAM: &str = "handle";
/// Requests a long-poll once caught up.
pub const LIVE_PARAM: &str = "live";
/// Cursor echoed back on live requests.
pub const CURSOR_PARAM: &str = "cursor";
/// Prefix of positional where-clause parameters, as in `params[1]`.
pub const WHERE_PARAMS_PREFIX: &str = "params";

/// Query parameters owned by the sync loop; callers may not set them.
pub const RESERVED_PARAMS: [&str; 4] = [OFFSET_PARAM, HANDLE_PARAM, LIVE_PARAM, CURSOR_PARAM];

/// Formats the query key of a positional where-clause parameter.
pub fn where_param_key(position: &str) -> String {
    format!("{WHERE_PARAMS_PREFIX}[{position}]")
}
