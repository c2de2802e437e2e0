//! chunkup: resumable, integrity-checked chunked uploads.
//!
//! ```bash
//! # Receiver
//! chunkup serve --root ./data --addr 0.0.0.0:7070
//!
//! # Sender
//! chunkup send ./disk.img --addr 10.0.0.5:7070 --state ./resume.json
//! ```

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Status(args) => commands::status::run(args).await,
    }
}
