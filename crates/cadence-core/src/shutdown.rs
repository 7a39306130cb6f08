//! Graceful shutdown coordination for background loops

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Cloneable shutdown signal.
///
/// Backed by a `watch` channel so a loop that starts waiting after the
/// signal was raised still observes it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown (idempotent)
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An Err means every sender is gone, which only happens once we are
        // being dropped; treat it as shutdown.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Trigger on SIGINT / SIGTERM (ctrl-c elsewhere)
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                match (
                    signal(SignalKind::interrupt()),
                    signal(SignalKind::terminate()),
                ) {
                    (Ok(mut sigint), Ok(mut sigterm)) => {
                        tokio::select! {
                            _ = sigint.recv() => warn!("Received SIGINT, shutting down"),
                            _ = sigterm.recv() => warn!("Received SIGTERM, shutting down"),
                        }
                    }
                    _ => {
                        warn!("Could not install unix signal handlers, falling back to ctrl-c");
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                warn!("Received ctrl-c, shutting down");
            }
            shutdown.trigger();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_observes_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_triggered());

        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();

        let waiter = tokio::spawn(async move { other.wait().await });
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
