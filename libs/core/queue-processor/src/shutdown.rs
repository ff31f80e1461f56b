//! Graceful shutdown coordination
//!
//! Merges the caller's cancellation channel with Ctrl+C and SIGTERM into one watch
//! channel. Only the worker's poll loop observes it; batches already handed to the
//! worker pool run to completion.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One cancellation source for a worker run.
pub struct GracefulShutdown {
    tx: Arc<watch::Sender<bool>>,
    listener: JoinHandle<()>,
}

impl GracefulShutdown {
    /// Listen on `external`, Ctrl+C and SIGTERM.
    pub fn new(external: watch::Receiver<bool>) -> Self {
        Self::spawn(external, true)
    }

    /// Listen on `external` only, for workers embedded in a host that handles signals.
    pub fn external_only(external: watch::Receiver<bool>) -> Self {
        Self::spawn(external, false)
    }

    fn spawn(external: watch::Receiver<bool>, os_signals: bool) -> Self {
        let (tx, _) = watch::channel(false);
        let tx = Arc::new(tx);

        let sender = tx.clone();
        let listener = tokio::spawn(async move {
            if os_signals {
                tokio::select! {
                    _ = external_cancelled(external) => {
                        debug!("External cancellation requested");
                    }
                    _ = ctrl_c() => {
                        info!("Received Ctrl+C, initiating shutdown...");
                    }
                    _ = terminate() => {
                        info!("Received SIGTERM, initiating shutdown...");
                    }
                }
            } else {
                external_cancelled(external).await;
                debug!("External cancellation requested");
            }
            sender.send_replace(true);
        });

        Self { tx, listener }
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Request shutdown directly.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for GracefulShutdown {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Resolves when the channel reads `true`. A dropped sender never cancels.
async fn external_cancelled(mut external: watch::Receiver<bool>) {
    let cancelled = external.wait_for(|cancelled| *cancelled).await.is_ok();
    if !cancelled {
        std::future::pending::<()>().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
