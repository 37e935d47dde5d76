//! Cooperative shutdown for the pipeline processes.
//!
//! SIGINT / SIGTERM flip an atomic flag and wake any task parked in
//! [`Shutdown::sleep`]. Components check the flag at batch boundaries, so an
//! in-flight batch is abandoned without ack or cursor advance and redelivery
//! restores it on the next run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Spawn the signal listeners. Call once per process, right after the
    /// runtime is up.
    pub fn listen_for_signals(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("Failed to install SIGTERM handler: {}", e);
                        let _ = ctrl_c.await;
                        this.trigger();
                        return;
                    },
                };
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received SIGINT, draining"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, draining"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                tracing::info!("Received Ctrl-C, draining");
            }
            this.trigger();
        });
    }

    /// Sleep for `duration`, returning early (with `false`) if shutdown is
    /// triggered in the meantime.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle =
            tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();
        assert!(!handle.await.unwrap());
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn sleep_completes_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }
}
