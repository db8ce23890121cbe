//! fs-tee: one-way replication of a directory tree.
//!
//! Watches SOURCE and copies every changed path into DESTINATION once its
//! changes have settled for the configured aggregation window.

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::error::ErrorKind;
use std::pin::pin;
use std::sync::Arc;
use tee_core::event::Watcher;
use tee_core::{CachedStorage, Path, Syncer, skip_vanished};
use tee_daemon::{Args, EXIT_INVALID_ARGUMENT, FileWatcher, NativeFs, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args.resolved(),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
            _ => {
                let _ = err.print();
                std::process::exit(EXIT_INVALID_ARGUMENT);
            }
        },
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.default_log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match args.syncer_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(EXIT_INVALID_ARGUMENT);
        }
    };

    for root in [&args.source, &args.destination] {
        let metadata = tokio::fs::metadata(root)
            .await
            .with_context(|| format!("cannot access {:?}", root))?;
        if !metadata.is_dir() {
            bail!("{:?} is not a directory", root);
        }
    }

    info!("Starting fs-tee");
    info!("Source: {:?}", args.source);
    info!("Destination: {:?}", args.destination);

    let source = Arc::new(NativeFs::new(args.source.clone()));
    let destination = Arc::new(CachedStorage::new(
        Arc::new(NativeFs::new(args.destination.clone())),
        args.cache_config(),
    ));

    let cancel = CancellationToken::new();
    let syncer = Syncer::new(Arc::clone(&source), destination, config, cancel.clone())?;

    // Listen before the (possibly long) startup walk so it can be interrupted.
    let mut shutdown = pin!(signal::wait_for_shutdown());
    let startup = async {
        let (watcher, events) =
            FileWatcher::new(Arc::clone(&source)).context("failed to create file watcher")?;
        watcher
            .watch(&Path::root())
            .await
            .context("failed to watch source tree")?;
        info!("Watching {:?}", watcher.root());
        syncer.ingest(events, Arc::new(watcher));

        if args.skip_initial_sync {
            info!("Skipping initial sync");
        } else {
            info!("Queueing initial sync");
            syncer
                .queue_recursive(&Path::root(), None, Some(&skip_vanished))
                .await
                .context("initial sync failed")?;
        }
        anyhow::Ok(())
    };

    match signal::interruptible(startup, shutdown.as_mut()).await {
        Ok(started) => {
            started?;
            shutdown.await?;
        }
        Err(interrupted) => {
            interrupted?;
            info!("Interrupted during startup");
        }
    }

    info!("Shutting down");
    syncer.shutdown().await;
    Ok(())
}
