//! Change and control messages of a shape log.

use crate::error::{ProtocolError, ProtocolResult};
use crate::parser::ValueParser;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A row: column name to value.
pub type Row = Map<String, Value>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Row entered the shape.
    Insert,
    /// Row changed; the value may only carry the changed columns.
    Update,
    /// Row left the shape.
    Delete,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ProtocolError::invalid_message(format!(
                "unknown operation {other:?}"
            ))),
        }
    }
}

/// A row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    /// Key derived from the row's primary key; unique within a shape.
    pub key: String,
    /// New row value (for deletes, at least the primary key columns).
    pub value: Row,
    /// Previous values of changed columns, present for `replica=full` updates.
    pub old_value: Option<Row>,
    /// What happened to the row.
    pub operation: Operation,
    /// Any further headers sent with the change (`txids`, `relation`, ...).
    pub headers: Row,
}

impl ChangeMessage {
    /// Creates a change message with no extra headers.
    pub fn new(key: impl Into<String>, operation: Operation, value: Row) -> Self {
        Self {
            key: key.into(),
            value,
            old_value: None,
            operation,
            headers: Row::new(),
        }
    }

    /// Creates an insert.
    pub fn insert(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Insert, value)
    }

    /// Creates an update.
    pub fn update(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Update, value)
    }

    /// Creates a delete.
    pub fn delete(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Delete, value)
    }

    /// Adds an extra header.
    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    /// Transaction ids the change belongs to, if the server reported them.
    pub fn txids(&self) -> Vec<u64> {
        self.headers
            .get("txids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }
}

/// Protocol-level signal carried by a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// The consumer has caught up with the log.
    UpToDate,
    /// The handle is no longer valid: discard state and refetch.
    MustRefetch,
    /// End of an initial snapshot segment.
    SnapshotEnd,
}

impl Control {
    /// Wire name of the control signal.
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::UpToDate => "up-to-date",
            Control::MustRefetch => "must-refetch",
            Control::SnapshotEnd => "snapshot-end",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "up-to-date" => Some(Control::UpToDate),
            "must-refetch" => Some(Control::MustRefetch),
            "snapshot-end" => Some(Control::SnapshotEnd),
            _ => None,
        }
    }
}

/// A control message.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// The signal.
    pub control: Control,
    /// Remaining headers, e.g. `global_last_seen_lsn`.
    pub headers: Row,
}

impl ControlMessage {
    /// Creates a control message with no extra headers.
    pub fn new(control: Control) -> Self {
        Self {
            control,
            headers: Row::new(),
        }
    }

    /// Creates an `up-to-date` message.
    pub fn up_to_date() -> Self {
        Self::new(Control::UpToDate)
    }

    /// Creates a `must-refetch` message.
    pub fn must_refetch() -> Self {
        Self::new(Control::MustRefetch)
    }
}

/// One entry of a shape log.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A row change.
    Change(ChangeMessage),
    /// A protocol signal.
    Control(ControlMessage),
}

impl Message {
    /// Returns true for an `up-to-date` control message.
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Message::Control(c) if c.control == Control::UpToDate)
    }

    /// Returns true for a `must-refetch` control message.
    pub fn is_must_refetch(&self) -> bool {
        matches!(self, Message::Control(c) if c.control == Control::MustRefetch)
    }

    /// Returns the change, if this is a change message.
    pub fn as_change(&self) -> Option<&ChangeMessage> {
        match self {
            Message::Change(change) => Some(change),
            Message::Control(_) => None,
        }
    }

    /// Encodes the message in its wire form.
    pub fn to_json(&self) -> Value {
        match self {
            Message::Change(change) => {
                let mut headers = change.headers.clone();
                headers.insert(
                    "operation".into(),
                    Value::String(change.operation.as_str().into()),
                );
                let mut object = Row::new();
                object.insert("key".into(), Value::String(change.key.clone()));
                object.insert("value".into(), Value::Object(change.value.clone()));
                if let Some(old) = &change.old_value {
                    object.insert("old_value".into(), Value::Object(old.clone()));
                }
                object.insert("headers".into(), Value::Object(headers));
                Value::Object(object)
            }
            Message::Control(control) => {
                let mut headers = control.headers.clone();
                headers.insert(
                    "control".into(),
                    Value::String(control.control.as_str().into()),
                );
                let mut object = Row::new();
                object.insert("headers".into(), Value::Object(headers));
                Value::Object(object)
            }
        }
    }

    /// Decodes one wire entry, parsing row values with `parser`.
    ///
    /// Returns `Ok(None)` for entries this client does not act on (events and
    /// unknown control signals); they are skipped rather than treated as errors.
    pub fn from_json(entry: Value, schema: &Schema, parser: &ValueParser) -> ProtocolResult<Option<Self>> {
        let Value::Object(mut object) = entry else {
            return Err(ProtocolError::invalid_message("entry is not an object"));
        };
        let mut headers = match object.remove("headers") {
            Some(Value::Object(headers)) => headers,
            Some(_) => return Err(ProtocolError::invalid_message("headers is not an object")),
            None => return Err(ProtocolError::invalid_message("missing headers")),
        };

        if let Some(control) = headers.remove("control") {
            let name = control
                .as_str()
                .ok_or_else(|| ProtocolError::invalid_message("control is not a string"))?;
            return Ok(Control::from_wire(name).map(|control| {
                Message::Control(ControlMessage { control, headers })
            }));
        }

        let Some(operation) = headers.remove("operation") else {
            // `event` entries (e.g. move-out) and anything newer
            return Ok(None);
        };
        let operation: Operation = operation
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_message("operation is not a string"))?
            .parse()?;

        let key = match object.remove("key") {
            Some(Value::String(key)) => key,
            _ => return Err(ProtocolError::invalid_message("change without string key")),
        };
        let mut value = match object.remove("value") {
            Some(Value::Object(value)) => value,
            _ => return Err(ProtocolError::invalid_message("change without object value")),
        };
        parser.parse_row(&mut value, schema)?;

        let old_value = match object.remove("old_value") {
            Some(Value::Object(mut old)) => {
                parser.parse_row(&mut old, schema)?;
                Some(old)
            }
            _ => None,
        };

        Ok(Some(Message::Change(ChangeMessage {
            key,
            value,
            old_value,
            operation,
            headers,
        })))
    }
}

impl From<ChangeMessage> for Message {
    fn from(change: ChangeMessage) -> Self {
        Message::Change(change)
    }
}

impl From<ControlMessage> for Message {
    fn from(control: ControlMessage) -> Self {
        Message::Control(control)
    }
}

/// Decodes a response body into an ordered batch.
///
/// An empty body yields an empty batch. A single object (as some proxies send
/// for 409 responses) is treated as a one-element batch.
pub fn parse_messages(body: &str, schema: &Schema, parser: &ValueParser) -> ProtocolResult<Vec<Message>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries = match serde_json::from_str::<Value>(body)? {
        Value::Array(entries) => entries,
        Value::Null => Vec::new(),
        single @ Value::Object(_) => vec![single],
        _ => return Err(ProtocolError::invalid_message("body is not an array")),
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(message) = Message::from_json(entry, schema, parser)? {
            messages.push(message);
        }
    }
    Ok(messages)
}

/// Encodes a batch in wire form.
pub fn encode_messages(messages: &[Message]) -> String {
    Value::Array(messages.iter().map(Message::to_json).collect()).to_string()
}
