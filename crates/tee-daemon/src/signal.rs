//! Process shutdown signals.

use anyhow::{Context, Result};
use std::future::Future;
use std::pin::Pin;
use tokio::signal::unix::{SignalKind, signal};

/// Resolve on Ctrl-C or SIGTERM.
pub async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Run `work` until it finishes or `interrupt` fires, whichever is first.
///
/// `interrupt` is borrowed so it can still be awaited after `work` wins.
pub async fn interruptible<W, I>(work: W, interrupt: Pin<&mut I>) -> Result<W::Output, I::Output>
where
    W: Future,
    I: Future,
{
    tokio::select! {
        biased;
        output = interrupt => Err(output),
        output = work => Ok(output),
    }
}
