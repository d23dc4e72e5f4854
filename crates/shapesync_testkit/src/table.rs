//! Tables and their change logs.

use crate::error::{ServerError, ServerResult};
use indexmap::IndexMap;
use serde_json::{json, Value};
use shapesync_protocol::{ChangeMessage, ColumnInfo, Offset, Row, Schema, ShapeHandle};

/// Definition of a table served by the reference server.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Column types.
    pub schema: Schema,
    /// Primary key columns, in order.
    pub primary_key: Vec<String>,
}

impl TableDef {
    /// Creates a table without columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Schema::new(),
            primary_key: Vec::new(),
        }
    }

    /// Adds a column.
    pub fn column(mut self, name: impl Into<String>, info: ColumnInfo) -> Self {
        self.schema.insert(name.into(), info);
        self
    }

    /// Adds a primary key column; it is `NOT NULL`.
    pub fn primary_key_column(mut self, name: impl Into<String>, type_name: &str) -> Self {
        let name = name.into();
        self.schema
            .insert(name.clone(), ColumnInfo::new(type_name).not_null());
        self.primary_key.push(name);
        self
    }

    /// Derives the log key of a row from its primary key.
    pub fn key_for(&self, row: &Row) -> ServerResult<String> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for column in &self.primary_key {
            let value = row
                .get(column)
                .filter(|v| !v.is_null())
                .ok_or_else(|| ServerError::MissingPrimaryKey {
                    table: self.name.clone(),
                    column: column.clone(),
                })?;
            parts.push(text_of(value));
        }
        let pk: Vec<&str> = parts.iter().map(String::as_str).collect();
        Ok(row_key(&self.name, &pk))
    }

    /// Encodes a row the way the server sends it: every value as text.
    pub fn encode_row(&self, row: &Row) -> Row {
        row.iter()
            .map(|(column, value)| {
                let json_column = self
                    .schema
                    .get(column)
                    .is_some_and(|info| matches!(info.type_name.as_str(), "json" | "jsonb"));
                let encoded = match value {
                    Value::Null => Value::Null,
                    _ if json_column => Value::String(value.to_string()),
                    _ => Value::String(text_of(value)),
                };
                (column.clone(), encoded)
            })
            .collect()
    }

    fn primary_key_of(&self, row: &Row) -> Row {
        row.iter()
            .filter(|(column, _)| self.primary_key.contains(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }
}

/// Key of a row as the server reports it, e.g. `"public"."todos"/"1"`.
pub fn row_key(table: &str, primary_key: &[&str]) -> String {
    let mut key = format!("\"public\".\"{}\"", table);
    for part in primary_key {
        key.push_str(&format!("/\"{}\"", part));
    }
    key
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "t".to_string(),
        Value::Bool(false) => "f".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => array_literal(items),
        Value::Object(_) => value.to_string(),
    }
}

fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            other => text_of(other),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

/// One entry of a table's change log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Position of the entry.
    pub offset: Offset,
    /// The change, with text-encoded values.
    pub change: ChangeMessage,
}

/// A table's rows and the log of changes since its handle was issued.
#[derive(Debug)]
pub(crate) struct TableLog {
    pub(crate) def: TableDef,
    pub(crate) handle: ShapeHandle,
    pub(crate) rows: IndexMap<String, Row>,
    pub(crate) entries: Vec<LogEntry>,
    start: Offset,
}

impl TableLog {
    pub(crate) fn new(def: TableDef, handle: ShapeHandle, start: Offset) -> Self {
        Self {
            def,
            handle,
            rows: IndexMap::new(),
            entries: Vec::new(),
            start,
        }
    }

    /// Offset of the newest entry.
    pub(crate) fn offset(&self) -> Offset {
        self.entries
            .last()
            .map(|entry| entry.offset)
            .unwrap_or(self.start)
    }

    pub(crate) fn since(&self, offset: Offset) -> &[LogEntry] {
        let first = self
            .entries
            .partition_point(|entry| !offset.is_before(&entry.offset));
        &self.entries[first..]
    }

    /// Current rows as encoded inserts.
    pub(crate) fn snapshot(&self) -> Vec<ChangeMessage> {
        self.rows
            .iter()
            .map(|(key, row)| ChangeMessage::insert(key.clone(), self.def.encode_row(row)))
            .collect()
    }

    pub(crate) fn insert(&mut self, row: Row, tx: u64) -> ServerResult<Offset> {
        let key = self.def.key_for(&row)?;
        if self.rows.contains_key(&key) {
            return Err(ServerError::DuplicateKey {
                table: self.def.name.clone(),
                key,
            });
        }
        let change = ChangeMessage::insert(key.clone(), self.def.encode_row(&row));
        self.rows.insert(key, row);
        Ok(self.append(change, tx))
    }

    pub(crate) fn update(&mut self, changes: Row, tx: u64) -> ServerResult<Offset> {
        let key = self.def.key_for(&changes)?;
        let Some(existing) = self.rows.get_mut(&key) else {
            return Err(ServerError::UnknownKey {
                table: self.def.name.clone(),
                key,
            });
        };
        for (column, value) in &changes {
            existing.insert(column.clone(), value.clone());
        }
        let change = ChangeMessage::update(key, self.def.encode_row(&changes));
        Ok(self.append(change, tx))
    }

    pub(crate) fn delete(&mut self, row: Row, tx: u64) -> ServerResult<Offset> {
        let key = self.def.key_for(&row)?;
        if self.rows.shift_remove(&key).is_none() {
            return Err(ServerError::UnknownKey {
                table: self.def.name.clone(),
                key,
            });
        }
        let primary_key = self.def.primary_key_of(&row);
        let change = ChangeMessage::delete(key, self.def.encode_row(&primary_key));
        Ok(self.append(change, tx))
    }

    /// Issues a new handle; the old log is gone.
    pub(crate) fn rotate(&mut self, handle: ShapeHandle) {
        self.start = self.offset();
        self.entries.clear();
        self.handle = handle;
    }

    fn append(&mut self, change: ChangeMessage, tx: u64) -> Offset {
        let offset = Offset::log(tx, 0);
        self.entries.push(LogEntry {
            offset,
            change: change.with_header("txids", json!([tx])),
        });
        offset
    }
}
