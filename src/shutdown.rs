//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] bridges process termination signals (SIGTERM, SIGINT)
//! to the bus client's stop sequence. Components hold clones and either
//! `subscribe()` for a receiver or `wait()` inside a `tokio::select!`.
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::select! {
//!     _ = shutdown.wait_for_signal() => {}
//!     result = serve() => result?,
//! }
//! client.stop().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A signal for coordinating graceful shutdown across components.
///
/// When a termination signal is received (or [`trigger`](Self::trigger) is
/// called), all components holding a clone are notified.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait for SIGTERM or SIGINT, then notify all receivers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger();
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// True once shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    /// Wait for shutdown with a timeout. Returns `true` if the signal
    /// arrived within the window.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let mut receiver = self.sender.subscribe();

        tokio::select! {
            _ = receiver.recv() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Shutdown wait timed out"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();
        assert!(!signal.is_triggered());

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        let mut receiver1 = signal.subscribe();
        let mut receiver2 = signal2.subscribe();

        signal.trigger();

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
        assert!(signal2.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_with_timeout_expires() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_millis(10)).await);

        signal.trigger();
        assert!(signal.wait_with_timeout(Duration::from_millis(10)).await);
    }
}
