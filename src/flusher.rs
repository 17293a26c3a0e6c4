//! Turns pending batches into backend submissions.
//!
//! A flush sums what a batch holds when it starts, reports that sum once
//! and, only if the backend accepted it, drops the entries it covered.
//! Flushes of the same subscription item are serialized. Different items
//! flush independently and one failing never stops the others.

use crate::accumulator::{BatchStore, PendingFlush};
use crate::error::MeteringError;
use crate::reporter::{UsageAction, UsageRecord, UsageReporter};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{event, Level};

/// Result of flushing a single subscription item.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    Flushed(PendingFlush),
    /// Nothing was pending, the backend was not called.
    Empty,
}

/// Counts from one sweep over every pending subscription item.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    pub flushed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub(crate) fn lock_store(store: &Mutex<BatchStore>) -> MutexGuard<'_, BatchStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BatchFlusher {
    reporter: Arc<dyn UsageReporter>,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BatchFlusher {
    pub fn new(reporter: Arc<dyn UsageReporter>) -> Self {
        BatchFlusher {
            reporter,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Flushes the batch of one subscription item.
    ///
    /// On failure the batch is left untouched so a later flush retries it.
    /// If the backend partially applied the write before failing, that
    /// retry submits the same usage twice.
    pub async fn flush(
        &self,
        store: &Mutex<BatchStore>,
        key: &str,
    ) -> Result<FlushOutcome, MeteringError> {
        let key_lock = self.key_lock(key);
        let _in_flight = key_lock.lock().await;

        let snapshot = lock_store(store).snapshot(key);
        let Some(pending) = snapshot else {
            return Ok(FlushOutcome::Empty);
        };

        let record = UsageRecord {
            subscription_item: key.to_string(),
            quantity: pending.quantity,
            timestamp: Utc::now().timestamp(),
            action: UsageAction::Increment,
        };
        event!(
            Level::DEBUG,
            subscription_item = key,
            quantity = pending.quantity,
            entries = pending.entry_count,
            "Flushing usage batch."
        );

        match self.reporter.report_usage(&record).await {
            Ok(()) => {
                lock_store(store).acknowledge(key, pending.entry_count);
                event!(Level::DEBUG, subscription_item = key, "Usage batch flushed.");
                Ok(FlushOutcome::Flushed(pending))
            }
            Err(source) => Err(MeteringError::backend(
                format!("Failed to report usage for subscription item {}", key),
                Some(key),
                source,
            )),
        }
    }

    /// Flushes every subscription item pending when the sweep starts.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn flush_all(&self, store: &Mutex<BatchStore>) -> SweepSummary {
        let keys = lock_store(store).keys();
        let results = join_all(keys.iter().map(|key| async move {
            let result = self.flush(store, key).await;
            (key, result)
        }))
        .await;

        let mut summary = SweepSummary::default();
        for (key, result) in results {
            match result {
                Ok(FlushOutcome::Flushed(_)) => summary.flushed += 1,
                Ok(FlushOutcome::Empty) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    event!(
                        Level::ERROR,
                        subscription_item = key.as_str(),
                        code = err.code(),
                        status = err.status_code(),
                        "Usage batch flush failed. {}",
                        err
                    );
                }
            }
        }
        event!(
            Level::DEBUG,
            flushed = summary.flushed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Usage sweep finished."
        );
        summary
    }
}
