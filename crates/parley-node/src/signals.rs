//! Shutdown signalling.
//!
//! Every long-running loop in a node (listener, manager, session readers,
//! media loops, connect retries) selects on a [`ShutdownHandle`], so a
//! single trigger unblocks reads, accepts and sleeps at once.
//! [`SignalHandler`] turns SIGTERM/SIGINT (Ctrl+C elsewhere) into a trigger.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

/// Cloneable cancellation flag backed by a watch channel.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Triggers a shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been triggered, immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any handle, so this only errs once
        // every clone is gone.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Turns process signals into a shutdown of the handle it owns.
#[derive(Debug, Default)]
pub struct SignalHandler {
    shutdown: ShutdownHandle,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the task waiting for SIGTERM or SIGINT.
    #[cfg(unix)]
    pub fn spawn_listener(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, logging out"),
                _ = sigint.recv() => info!("Received SIGINT, logging out"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.trigger();
            debug!("Signal listener stopped");
        });
        Ok(())
    }

    /// Ctrl+C only.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("Received Ctrl+C, logging out");
                        shutdown.trigger();
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn trigger_is_seen_by_every_clone() {
        let handler = SignalHandler::new();
        let a = handler.shutdown_handle();
        let b = a.clone();
        assert!(!b.is_shutdown());

        a.trigger();
        a.trigger();

        assert!(b.is_shutdown());
        assert!(handler.shutdown_handle().is_shutdown());
    }

    #[tokio::test]
    async fn all_waiters_wake() {
        let handle = ShutdownHandle::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(500), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn already_triggered_returns_immediately() {
        let handle = ShutdownHandle::new();
        handle.trigger();
        let result = tokio::time::timeout(Duration::from_millis(100), handle.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unblocks_a_pending_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = ShutdownHandle::new();
        let stop = handle.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = listener.accept() => false,
                _ = stop.cancelled() => true,
            }
        });
        handle.trigger();

        let cancelled = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled);
    }
}
