use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::IntegrityGuard;

/// Periodic background verification of protected files.
///
/// Only touches protection state and the shared `trusted` flag; it never sees the queue.
pub struct IntegrityMonitor {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl IntegrityMonitor {
    pub fn spawn(guard: Arc<IntegrityGuard>, interval: Duration, trusted: Arc<AtomicBool>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let period = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => break,
                }
                match guard.check() {
                    Ok(violations) if !violations.is_empty() => {
                        if trusted.swap(false, Ordering::SeqCst) {
                            tracing::error!(count = violations.len(), "protected files drifted; session is untrusted");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("integrity check failed: {}", e),
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}
