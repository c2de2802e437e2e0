use std::fmt::Display;
use std::path::Path;

use clap::{Parser, Subcommand};

pub mod send;
pub mod serve;
pub mod status;

/// Default coordinator address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:7070";

#[derive(Parser)]
#[command(name = "chunkup", version, about = "Resumable chunked file uploads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an upload coordinator over TCP.
    Serve(serve::ServeArgs),
    /// Upload one file to a coordinator.
    Send(send::SendArgs),
    /// Show coordinator health or the progress of one task.
    Status(status::StatusArgs),
}

/// Loads a config file, falling back to defaults if it is absent or broken.
pub fn load_config<T, E, F>(path: Option<&Path>, load: F) -> T
where
    T: Default,
    E: Display,
    F: FnOnce(&Path) -> Result<T, E>,
{
    let Some(path) = path else {
        return T::default();
    };
    match load(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "configuration loaded");
            config
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            T::default()
        }
    }
}
