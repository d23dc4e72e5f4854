//! CLI command implementations.

pub mod snapshot;
pub mod tail;

use clap::Args;
use shapesync_client::{HttpClient, LogMode, Replica, ShapeStreamOptions};
use std::path::PathBuf;
use std::sync::Arc;

pub use snapshot::SnapshotArgs;
pub use tail::TailArgs;

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Arguments that define a shape.
#[derive(Args, Debug, Clone, Default)]
pub struct ShapeArgs {
    /// Shape endpoint, e.g. http://localhost:3000/v1/shape
    #[arg(long)]
    pub url: String,

    /// Table to sync
    #[arg(short, long)]
    pub table: String,

    /// Row filter
    #[arg(short, long = "where")]
    pub where_clause: Option<String>,

    /// Column to include (repeatable; default all)
    #[arg(short, long = "column")]
    pub columns: Vec<String>,

    /// Positional value for $1, $2, ... in the filter (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Request header as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_key_value)]
    pub headers: Vec<(String, String)>,

    /// Send full rows on update
    #[arg(long)]
    pub full_replica: bool,

    /// Skip the initial snapshot and only receive changes
    #[arg(long)]
    pub changes_only: bool,
}

impl ShapeArgs {
    /// Builds stream options.
    pub fn to_options(&self, client: Option<Arc<dyn HttpClient>>) -> ShapeStreamOptions {
        let mut options = ShapeStreamOptions::new(&self.url)
            .with_table(&self.table)
            .with_params(self.params.iter());
        if let Some(where_clause) = &self.where_clause {
            options = options.with_where(where_clause);
        }
        if !self.columns.is_empty() {
            options = options.with_columns(self.columns.iter());
        }
        for (name, value) in &self.headers {
            options = options.with_header(name, value);
        }
        if self.full_replica {
            options = options.with_replica(Replica::Full);
        }
        if self.changes_only {
            options = options.with_log_mode(LogMode::ChangesOnly);
        }
        if let Some(client) = client {
            options = options.with_client(client);
        }
        options
    }
}

/// Parses `NAME=VALUE`.
fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))
}

/// Reads a state file if a path was given.
fn read_optional(path: &Option<PathBuf>) -> CommandResult<Option<String>> {
    match path {
        Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_values() {
        assert_eq!(
            parse_key_value("Authorization=Bearer a=b"),
            Ok(("Authorization".into(), "Bearer a=b".into()))
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn options_from_args() {
        let args = ShapeArgs {
            url: "http://localhost:3000/v1/shape".into(),
            table: "todos".into(),
            where_clause: Some("done = $1".into()),
            columns: vec!["id".into(), "title".into()],
            params: vec!["false".into()],
            headers: vec![("x-token".into(), "t".into())],
            full_replica: true,
            changes_only: false,
        };
        let options = args.to_options(None);
        assert_eq!(options.table.as_deref(), Some("todos"));
        assert_eq!(options.where_clause.as_deref(), Some("done = $1"));
        assert_eq!(options.columns, vec!["id", "title"]);
        assert_eq!(options.params.get("1").map(String::as_str), Some("false"));
        assert_eq!(options.headers.get("x-token").map(String::as_str), Some("t"));
        assert_eq!(options.replica, Replica::Full);
        assert_eq!(options.log, LogMode::Full);
    }
}
