//! notes-sync-daemon: headless harness that exercises the engine against
//! real storage directories on disk. Opens every `--sd` root, watches it,
//! and runs the packing/GC/snapshot schedulers until interrupted.

use anyhow::Result;
use clap::Parser;
use notes_sync_core::config::ENV_INSTANCE_ID;
use notes_sync_core::{EngineConfig, FileSystem, InstanceId, RetryingFs};
use notes_sync_daemon::{Daemon, NativeFs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "notes-sync-daemon")]
#[command(about = "Headless local-first notes sync engine, driven by storage-directory watchers")]
struct Args {
    /// A storage directory root to bring online. Repeatable.
    #[arg(long = "sd", required = true)]
    sd: Vec<PathBuf>,

    /// Override the auto-minted instance id (falls back to $INSTANCE_ID).
    #[arg(long = "instance-id")]
    instance_id: Option<String>,

    /// Enable debug-level logging, including comment-sync diagnostics.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let instance_id = args
        .instance_id
        .or_else(|| std::env::var(ENV_INSTANCE_ID).ok())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(InstanceId::new);

    info!(%instance_id, sds = args.sd.len(), "starting notes-sync-daemon");

    let config = EngineConfig::from_env();
    let fs: Arc<dyn FileSystem> = Arc::new(RetryingFs::new(NativeFs::new("/"), config.io_retry_attempts));

    let daemon = Daemon::start(fs, &args.sd, instance_id, config).await?;
    info!("daemon running, press ctrl-c to stop");
    daemon.run().await?;

    info!("shut down cleanly");
    Ok(())
}
