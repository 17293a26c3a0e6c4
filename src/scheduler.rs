//! Recurring flush timer.
//!
//! The timer runs as a task on the Tokio runtime and only holds a weak
//! reference to whatever it sweeps, so it never keeps that state alive.
//! When the target is dropped the task ends on its next tick.
//!
//! Stopping the timer only stops future ticks. A sweep that already
//! started runs to completion, so backend calls are never cut off.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{event, Level};

pub struct FlushTimer {
    handle: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl FlushTimer {
    /// Calls `sweep` every `period` until stopped or until `target` is
    /// gone. The first sweep happens one full period after start.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<T, F, Fut>(period: Duration, target: Weak<T>, sweep: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        event!(Level::DEBUG, "Flush timer stopped.");
                        break;
                    }
                }
                let Some(live) = target.upgrade() else {
                    event!(Level::DEBUG, "Flush target dropped, stopping timer.");
                    break;
                };
                // Not raced against shutdown: a started sweep finishes.
                sweep(live).await;
            }
        });

        FlushTimer {
            handle: Some(handle),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the timer and waits for a sweep in progress to finish.
    /// Returns false if it was already stopped.
    pub async fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        // The task may already be gone, in which case nobody listens.
        let _ = self.shutdown.send(true);
        if let Err(err) = handle.await {
            event!(Level::ERROR, "Flush timer task failed. {}", err);
        }
        true
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FlushTimer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn count(counter: Arc<AtomicUsize>) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = FlushTimer::start(
            Duration::from_millis(1000),
            Arc::downgrade(&counter),
            count,
        );
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(timer.stop().await);
        assert!(!timer.stop().await);
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_sweep() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut timer = FlushTimer::start(
            Duration::from_millis(100),
            Arc::downgrade(&completed),
            |completed: Arc<AtomicUsize>| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            },
        );

        // The first sweep starts at 100ms and is still sleeping.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        assert!(timer.stop().await);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_target_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = FlushTimer::start(
            Duration::from_millis(100),
            Arc::downgrade(&counter),
            count,
        );
        drop(counter);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!timer.is_running());
    }
}
