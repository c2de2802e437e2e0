use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chunkup_data_channel::TcpTransport;
use chunkup_session::{
    JsonFileStore, SessionConfig, SessionEvent, SessionStatus, SessionStore, TransferSession,
};
use chunkup_transfer::DigestAlgorithm;
use clap::Args;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::{DEFAULT_ADDR, load_config};

#[derive(Args)]
pub struct SendArgs {
    /// File to upload.
    pub file: PathBuf,

    /// Coordinator address.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// JSON session config.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Resume state file. Interrupted uploads continue from here.
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Artifact name (defaults to the file name).
    #[arg(long)]
    pub name: Option<String>,

    /// Chunk size in bytes.
    #[arg(long)]
    pub chunk_size: Option<u32>,

    /// Concurrent chunk transmissions.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Send a digest with every chunk.
    #[arg(long)]
    pub verify: bool,

    /// Use SHA-256 instead of MD5 for digests.
    #[arg(long)]
    pub sha256: bool,

    /// Skip the instant-upload check.
    #[arg(long)]
    pub no_instant: bool,
}

pub async fn run(args: SendArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref(), SessionConfig::from_file);
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent = concurrency;
    }
    config.verify_chunk_digest |= args.verify;
    if args.sha256 {
        config.digest_algorithm = DigestAlgorithm::Sha256;
    }
    if args.no_instant {
        config.enable_instant_upload = false;
    }

    let transport =
        Arc::new(TcpTransport::new(args.addr.clone()).with_chunk_timeout(config.chunk_timeout));
    let mut builder = TransferSession::builder(args.file.clone(), transport).config(config);
    if let Some(state) = &args.state {
        let store = JsonFileStore::open(state.clone())
            .with_context(|| format!("opening resume state {}", state.display()))?;
        builder = builder.store(Arc::new(store) as Arc<dyn SessionStore>);
    }
    if let Some(name) = args.name {
        builder = builder.name(name);
    }
    let session = builder
        .open()
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;

    let reporter = tokio::spawn(report(session.subscribe()));

    // Ctrl-C pauses so the resume state keeps what was already sent. Before
    // chunks are flowing there is nothing to keep, so it cancels instead.
    let interrupt = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok()
            && interrupt.pause() != SessionStatus::Paused
        {
            interrupt.cancel().await;
        }
    });

    let status = session.start().await;
    reporter.abort();

    match status? {
        SessionStatus::Completed => {
            if let Some(artifact) = session.artifact() {
                println!("{}", artifact.location);
            }
            Ok(())
        }
        SessionStatus::Paused => {
            warn!("upload paused; run the same command again to resume");
            Ok(())
        }
        SessionStatus::Cancelled => anyhow::bail!("upload cancelled"),
        other => anyhow::bail!("upload ended in state {other:?}"),
    }
}

async fn report(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Progress(p)) => info!(
                loaded = p.loaded,
                total = p.total,
                percent = %format_args!("{:.1}", p.percentage),
                speed_kib = %format_args!("{:.0}", p.speed / 1024.0),
                eta = ?p.remaining_time,
                "progress"
            ),
            Ok(SessionEvent::Success {
                location, instant, ..
            }) => info!(%location, instant, "upload complete"),
            Ok(SessionEvent::Error { kind, message }) => warn!(?kind, %message, "upload failed"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress reporter lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
