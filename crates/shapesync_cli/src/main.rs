//! Shapesync CLI
//!
//! Command-line tools for inspecting shapes.
//!
//! # Commands
//!
//! - `tail` - Follow a shape's log and print changes as JSON lines
//! - `snapshot` - Fetch a shape once and print its rows

mod commands;

use clap::{Parser, Subcommand};
use commands::{ShapeArgs, SnapshotArgs, TailArgs};
use tracing_subscriber::EnvFilter;

/// Shapesync command-line tools.
#[derive(Parser)]
#[command(name = "shapesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a shape and print each change as a JSON line
    Tail {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Resume from this offset (requires --handle)
        #[arg(long)]
        offset: Option<String>,

        /// Resume under this shape handle
        #[arg(long)]
        handle: Option<String>,

        /// Stop once caught up instead of waiting for new changes
        #[arg(long)]
        once: bool,
    },

    /// Fetch a shape once and print its rows as a JSON array
    Snapshot {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Resume from a state file written by --state-out
        #[arg(long)]
        state_in: Option<std::path::PathBuf>,

        /// Write the shape's state here for a later --state-in
        #[arg(long)]
        state_out: Option<std::path::PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Tail {
            shape,
            offset,
            handle,
            once,
        } => {
            let args = TailArgs {
                shape,
                offset,
                handle,
                once,
            };
            commands::tail::run(args, None, std::io::stdout()).await?;
        }
        Commands::Snapshot {
            shape,
            state_in,
            state_out,
        } => {
            let args = SnapshotArgs {
                shape,
                state_in,
                state_out,
            };
            commands::snapshot::run(args, None, &mut std::io::stdout()).await?;
        }
        Commands::Version => {
            println!("Shapesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
