//! Tail command implementation.

use super::{CommandResult, ShapeArgs};
use shapesync_client::{HttpClient, ShapeSource, ShapeStream};
use shapesync_protocol::{Message, Offset};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Arguments of `shapesync tail`.
#[derive(Debug, Clone, Default)]
pub struct TailArgs {
    /// The shape to follow.
    pub shape: ShapeArgs,
    /// Offset to resume from.
    pub offset: Option<String>,
    /// Handle to resume under.
    pub handle: Option<String>,
    /// Stop once caught up.
    pub once: bool,
}

/// Runs the tail command, writing one JSON line per message to `out`.
///
/// Runs until the stream halts, the shape is caught up with `once`, or
/// Ctrl-C is pressed.
pub async fn run<W>(args: TailArgs, client: Option<Arc<dyn HttpClient>>, out: W) -> CommandResult<()>
where
    W: Write + Send + 'static,
{
    let mut options = args.shape.to_options(client).with_subscribe(!args.once);
    if let Some(offset) = &args.offset {
        options = options.with_offset(offset.parse::<Offset>()?);
    }
    if let Some(handle) = &args.handle {
        options = options.with_handle(handle.as_str());
    }

    let stream = ShapeStream::new(options)?;
    let out = Arc::new(Mutex::new(out));
    let sink = Arc::clone(&out);
    let _subscription = stream.subscribe(move |messages| {
        let Ok(mut out) = sink.lock() else {
            return;
        };
        if let Err(err) = write_messages(&mut *out, messages) {
            warn!("Cannot write output: {}", err);
        }
    });

    tokio::select! {
        result = stream.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            stream.abort();
        }
    }

    if let Some(handle) = stream.shape_handle() {
        info!("Stopped at offset {} of handle {}", stream.last_offset(), handle);
    }
    Ok(())
}

fn write_messages<W: Write + ?Sized>(out: &mut W, messages: &[Message]) -> std::io::Result<()> {
    for message in messages {
        writeln!(out, "{}", message.to_json())?;
    }
    out.flush()
}
