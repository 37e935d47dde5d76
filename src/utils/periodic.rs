//! Periodic background tasks (staging mover, status heartbeat, model
//! refresh) sharing the process-wide shutdown flag.

use crate::utils::shutdown::Shutdown;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Run `task` every `interval` until shutdown. Failures are logged and the
/// schedule keeps going; a failing maintenance task must never take the
/// process down.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: Shutdown,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send,
{
    tokio::spawn(async move {
        tracing::info!("Periodic task '{}' started (interval: {:?})", name, interval);
        loop {
            if !shutdown.sleep(interval).await {
                break;
            }
            match task().await {
                Ok(()) => tracing::debug!("Periodic task '{}' completed", name),
                Err(e) => tracing::error!("Periodic task '{}' failed: {}", name, e),
            }
        }
        tracing::info!("Periodic task '{}' stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn runs_until_shutdown() {
        let counter = Arc::new(AtomicU32::new(0));
        let shutdown = Shutdown::new();
        let c = counter.clone();
        let handle = spawn_periodic("test", Duration::from_millis(5), shutdown.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.trigger();
        handle.await.unwrap();
        assert!(counter.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn errors_do_not_stop_the_schedule() {
        let counter = Arc::new(AtomicU32::new(0));
        let shutdown = Shutdown::new();
        let c = counter.clone();
        let handle = spawn_periodic("flaky", Duration::from_millis(5), shutdown.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("boom")
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.trigger();
        handle.await.unwrap();
        assert!(counter.load(Ordering::Relaxed) >= 2);
    }
}
