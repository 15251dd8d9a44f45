use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::shutdown::Shutdown;

/// What happens to a supervised task when shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnShutdown {
    /// Abort immediately, even mid-await.
    Cancel,
    /// Let the run in progress finish first. For work that must not be
    /// interrupted between externally visible steps, like a submission
    /// and the bookkeeping that records it.
    Drain,
}

/// Run a task under supervision.
///
/// Failures and panics are logged and the task is restarted after
/// `backoff`. The supervision ends when the task returns `Ok` or when
/// shutdown begins; a `Drain` task still gets to finish its current run.
pub fn supervise<S, F>(
    name: &'static str,
    future_spawner: S,
    backoff: Duration,
    on_shutdown: OnShutdown,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            // `catch_unwind` so one panicking run is a restart, not a
            // silently dead worker.
            let run = AssertUnwindSafe(future_spawner()).catch_unwind();

            let outcome = match on_shutdown {
                OnShutdown::Drain => Some(run.await),
                OnShutdown::Cancel => {
                    tokio::select! {
                        result = run => Some(result),
                        () = shutdown.await_shutdown_begin() => None,
                    }
                }
            };

            match outcome {
                None => {
                    info!(task = name, "Cancelled by shutdown");
                    return;
                }
                Some(Ok(Ok(()))) => {
                    info!(task = name, "Finished");
                    return;
                }
                Some(Ok(Err(err))) => {
                    error!(task = name, %err, "Supervised task failed");
                }
                Some(Err(panic)) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(task = name, %message, "Supervised task panicked");
                }
            }

            if shutdown.is_shutting_down() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = shutdown.await_shutdown_begin() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn restarts_until_the_task_succeeds() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = Shutdown::new();

        let handle = {
            let runs = runs.clone();
            supervise(
                "flaky",
                move || {
                    let runs = runs.clone();
                    async move {
                        // Fail twice, then settle.
                        if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("not yet");
                        }
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                OnShutdown::Cancel,
                shutdown,
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn panics_are_contained_and_retried() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = Shutdown::new();

        let handle = {
            let runs = runs.clone();
            supervise(
                "panicky",
                move || {
                    let runs = runs.clone();
                    async move {
                        if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("boom");
                        }
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                OnShutdown::Cancel,
                shutdown,
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_aborts_mid_flight() -> anyhow::Result<()> {
        let finished = Arc::new(AtomicBool::new(false));
        let shutdown = Shutdown::new();

        let handle = {
            let finished = finished.clone();
            supervise(
                "slow",
                move || {
                    let finished = finished.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                OnShutdown::Cancel,
                shutdown.clone(),
            )
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        assert!(!finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn drain_lets_the_current_run_finish() -> anyhow::Result<()> {
        let finished = Arc::new(AtomicBool::new(false));
        let shutdown = Shutdown::new();

        let handle = {
            let finished = finished.clone();
            supervise(
                "draining",
                move || {
                    let finished = finished.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                OnShutdown::Drain,
                shutdown.clone(),
            )
        };

        // Shutdown arrives while the run is still sleeping.
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        assert!(finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn no_restart_once_shutdown_began() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = Shutdown::new();
        shutdown.shutdown();

        let handle = {
            let runs = runs.clone();
            supervise(
                "failing",
                move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("always fails");
                    }
                },
                Duration::from_millis(10),
                OnShutdown::Drain,
                shutdown,
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
