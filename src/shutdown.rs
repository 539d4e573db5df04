// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Graceful Shutdown
//!
//! A small cancellation token shared between the consumer loop and the
//! process signal handlers. The signal listener sets the token; the consume
//! loop observes it between deliveries, cancels its subscription and drains
//! the in-flight message before returning.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::info;

/// Cancellation token for graceful draining.
///
/// Cloning shares the underlying state: any clone can trigger, every clone
/// observes the trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    notify: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Shutdown {
            notify,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the token as triggered and wakes every subscriber.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    /// True once a shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Completes when the token is triggered. Returns immediately if the
    /// trigger already happened.
    pub async fn recv(&self) {
        if self.is_triggered() {
            return;
        }

        let mut rx = self.notify.subscribe();

        // The trigger may have landed between the check and the subscribe.
        if self.is_triggered() {
            return;
        }

        let _ = rx.recv().await;
    }

    /// Spawns a background task that triggers this token on SIGINT or
    /// SIGTERM.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();

        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install the SIGTERM handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT, draining");
                }
                _ = terminate => {
                    info!("received SIGTERM, draining");
                }
            }

            shutdown.trigger();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn starts_untriggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn clones_share_the_trigger() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();

        shutdown.trigger();

        assert!(observer.is_triggered());
        observer.recv().await;
    }

    #[tokio::test]
    async fn recv_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();

        let waiter = tokio::spawn(async move { observer.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should complete after trigger")
            .unwrap();
    }
}
