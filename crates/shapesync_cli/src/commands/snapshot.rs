//! Snapshot command implementation.

use super::{read_optional, CommandResult, ShapeArgs};
use shapesync_client::{DehydratedState, HttpClient, ShapeClient};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Arguments of `shapesync snapshot`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotArgs {
    /// The shape to capture.
    pub shape: ShapeArgs,
    /// Dehydrated state to resume from.
    pub state_in: Option<PathBuf>,
    /// Where to write the dehydrated state afterwards.
    pub state_out: Option<PathBuf>,
}

/// Syncs the shape once and prints its rows as a JSON array.
pub async fn run(
    args: SnapshotArgs,
    client: Option<Arc<dyn HttpClient>>,
    out: &mut impl Write,
) -> CommandResult<()> {
    let state = match read_optional(&args.state_in)? {
        Some(json) => serde_json::from_str::<DehydratedState>(&json)?,
        None => DehydratedState::default(),
    };
    if !state.is_empty() {
        info!("Resuming {} dehydrated shape(s)", state.shapes.len());
    }

    let shapes = ShapeClient::with_state(state);
    let options = args.shape.to_options(client).with_subscribe(false);
    let stream = shapes.get_shape_stream(options)?;
    let shape = shapes.get_shape(&stream);
    stream.start().await?;

    let rows = shape.rows().await?;
    info!("Captured {} row(s) at offset {}", rows.len(), shape.last_offset());
    serde_json::to_writer_pretty(&mut *out, &rows)?;
    writeln!(out)?;

    if let Some(path) = &args.state_out {
        shapes.dehydrate(&shape).await?;
        let json = serde_json::to_string_pretty(&shapes.get_dehydrated_state())?;
        std::fs::write(path, json)?;
        info!("Wrote dehydrated state to {}", path.display());
    }

    shapes.clear();
    Ok(())
}
