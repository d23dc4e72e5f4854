//! Pluggable decoding of raw column values.
//!
//! The server sends every column in Postgres text format. A [`ValueParser`]
//! maps column type names to decode functions and applies them to each row
//! using the column [`Schema`](crate::schema::Schema). Types without a
//! registered parser are left as strings.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Row;
use crate::schema::{ColumnInfo, Schema};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

/// Decodes one non-null raw value of a given column type.
pub type ParseFn = Arc<dyn Fn(&str, &ColumnInfo) -> Result<Value, String> + Send + Sync>;

/// Type name to decode function, seeded with the default parsers.
#[derive(Clone)]
pub struct ValueParser {
    parsers: BTreeMap<String, ParseFn>,
    custom: BTreeSet<String>,
}

impl ValueParser {
    /// Creates a parser with the default decoders for numeric, boolean and
    /// JSON columns.
    pub fn new() -> Self {
        let mut parsers: BTreeMap<String, ParseFn> = BTreeMap::new();
        for type_name in ["int2", "int4", "int8"] {
            parsers.insert(type_name.into(), Arc::new(|raw, _| parse_integer(raw)));
        }
        for type_name in ["float4", "float8"] {
            parsers.insert(type_name.into(), Arc::new(|raw, _| Ok(parse_float(raw))));
        }
        parsers.insert(
            "bool".into(),
            Arc::new(|raw, _| Ok(Value::Bool(raw == "t" || raw == "true"))),
        );
        for type_name in ["json", "jsonb"] {
            parsers.insert(
                type_name.into(),
                Arc::new(|raw, _| serde_json::from_str(raw).map_err(|e| e.to_string())),
            );
        }

        Self {
            parsers,
            custom: BTreeSet::new(),
        }
    }

    /// Creates a parser that decodes nothing; every value stays a string.
    pub fn raw() -> Self {
        Self {
            parsers: BTreeMap::new(),
            custom: BTreeSet::new(),
        }
    }

    /// Registers (or overrides) the decoder for a type.
    pub fn with<F>(mut self, type_name: impl Into<String>, parse: F) -> Self
    where
        F: Fn(&str, &ColumnInfo) -> Result<Value, String> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.custom.insert(type_name.clone());
        self.parsers.insert(type_name, Arc::new(parse));
        self
    }

    /// Names of the types whose decoders were supplied by the caller.
    ///
    /// Two parsers with the same custom type set are treated as equivalent
    /// when shapes are deduplicated.
    pub fn custom_types(&self) -> impl Iterator<Item = &str> {
        self.custom.iter().map(String::as_str)
    }

    /// Returns true if a decoder is registered for the type.
    pub fn handles(&self, type_name: &str) -> bool {
        self.parsers.contains_key(type_name)
    }

    /// Decodes every column of `row` that appears in `schema`, in place.
    pub fn parse_row(&self, row: &mut Row, schema: &Schema) -> ProtocolResult<()> {
        for (column, value) in row.iter_mut() {
            let Some(info) = schema.get(column) else {
                continue;
            };
            let raw = std::mem::take(value);
            *value = self.parse_value(column, raw, info)?;
        }
        Ok(())
    }

    /// Decodes a single column value.
    pub fn parse_value(&self, column: &str, raw: Value, info: &ColumnInfo) -> ProtocolResult<Value> {
        match raw {
            Value::Null => {
                if info.is_nullable() {
                    Ok(Value::Null)
                } else {
                    Err(ProtocolError::NullInNonNullableColumn {
                        column: column.to_string(),
                    })
                }
            }
            Value::String(text) if info.is_array() => {
                let mut element = |token: Option<String>| match token {
                    None => Ok(Value::Null),
                    Some(text) => self.parse_scalar(column, text, info),
                };
                let mut reader = ArrayReader::new(&text);
                let value = reader.read_array(&mut element, 1)?;
                reader.expect_end()?;
                Ok(value)
            }
            Value::String(text) => self.parse_scalar(column, text, info),
            // already typed by an upstream proxy
            other => Ok(other),
        }
    }

    fn parse_scalar(&self, column: &str, text: String, info: &ColumnInfo) -> ProtocolResult<Value> {
        match self.parsers.get(&info.type_name) {
            Some(parse) => parse(&text, info).map_err(|message| ProtocolError::ValueParse {
                column: column.to_string(),
                type_name: info.type_name.clone(),
                message,
            }),
            None => Ok(Value::String(text)),
        }
    }
}

impl Default for ValueParser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ValueParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueParser")
            .field("types", &self.parsers.keys().collect::<Vec<_>>())
            .field("custom", &self.custom)
            .finish()
    }
}

fn parse_integer(raw: &str) -> Result<Value, String> {
    raw.parse::<i64>()
        .map(Value::from)
        .map_err(|e| e.to_string())
}

fn parse_float(raw: &str) -> Value {
    // NaN and +/-Infinity have no JSON number form
    match raw.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::String(raw.to_string()),
    }
}

/// Postgres rejects arrays with more dimensions than this.
const MAX_ARRAY_DEPTH: usize = 6;

/// Reader for Postgres array literals such as `{1,2,NULL}` or `{{"a b","c"}}`.
struct ArrayReader<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> ArrayReader<'a> {
    fn new(literal: &'a str) -> Self {
        Self {
            chars: literal.chars().peekable(),
        }
    }

    fn read_array(
        &mut self,
        element: &mut dyn FnMut(Option<String>) -> ProtocolResult<Value>,
        depth: usize,
    ) -> ProtocolResult<Value> {
        if depth > MAX_ARRAY_DEPTH {
            return Err(ProtocolError::invalid_array(format!(
                "more than {MAX_ARRAY_DEPTH} dimensions"
            )));
        }
        match self.chars.next() {
            Some('{') => {}
            Some(c) => return Err(ProtocolError::invalid_array(format!("expected '{{', found {c:?}"))),
            None => return Err(ProtocolError::invalid_array("empty literal")),
        }

        let mut items = Vec::new();
        if self.chars.peek() == Some(&'}') {
            self.chars.next();
            return Ok(Value::Array(items));
        }

        loop {
            let item = match self.chars.peek() {
                Some('{') => self.read_array(element, depth + 1)?,
                Some('"') => {
                    let text = self.read_quoted()?;
                    element(Some(text))?
                }
                Some(_) => {
                    let text = self.read_unquoted();
                    if text.eq_ignore_ascii_case("NULL") {
                        element(None)?
                    } else {
                        element(Some(text))?
                    }
                }
                None => return Err(ProtocolError::invalid_array("unexpected end of input")),
            };
            items.push(item);

            match self.chars.next() {
                Some(',') => continue,
                Some('}') => break,
                Some(c) => {
                    return Err(ProtocolError::invalid_array(format!(
                        "unexpected character {c:?}"
                    )))
                }
                None => return Err(ProtocolError::invalid_array("unterminated array")),
            }
        }

        Ok(Value::Array(items))
    }

    fn read_quoted(&mut self) -> ProtocolResult<String> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some('\\') => match self.chars.next() {
                    Some(c) => text.push(c),
                    None => return Err(ProtocolError::invalid_array("dangling escape")),
                },
                Some('"') => return Ok(text),
                Some(c) => text.push(c),
                None => return Err(ProtocolError::invalid_array("unterminated quoted element")),
            }
        }
    }

    fn read_unquoted(&mut self) -> String {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c == ',' || c == '}' {
                break;
            }
            text.push(c);
            self.chars.next();
        }
        text
    }

    fn expect_end(&mut self) -> ProtocolResult<()> {
        match self.chars.next() {
            None => Ok(()),
            Some(c) => Err(ProtocolError::invalid_array(format!(
                "trailing character {c:?}"
            ))),
        }
    }
}
