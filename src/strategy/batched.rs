//! The batching strategy.
//!
//! Usage is accumulated per subscription item and reported as one
//! aggregate per item. A batch is flushed when it reaches the configured
//! size, on every tick of the flush timer and, optionally, on disposal.
//!
//! Only the per-size flush reports its failure to the caller. Timer and
//! disposal sweeps log failures and keep the affected batches for the
//! next sweep.

use crate::accumulator::{BatchStore, UsageEntry};
use crate::config::MeteringConfig;
use crate::error::MeteringError;
use crate::flusher::{lock_store, BatchFlusher, FlushOutcome, SweepSummary};
use crate::reporter::UsageReporter;
use crate::resolver::SubscriptionResolver;
use crate::scheduler::FlushTimer;
use crate::strategy::{validate_usage, UsageStrategy};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{event, Level};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Active,
    /// Disposal has started. New usage is rejected while the final sweep
    /// runs.
    Disposing,
    Disposed,
}

/// What the flush timer needs to reach.
struct BatchState {
    store: Mutex<BatchStore>,
    flusher: BatchFlusher,
}

impl BatchState {
    async fn sweep(&self) -> SweepSummary {
        self.flusher.flush_all(&self.store).await
    }
}

pub struct BatchedStrategy {
    state: Arc<BatchState>,
    resolver: Arc<dyn SubscriptionResolver>,
    max_batch_size: usize,
    flush_on_dispose: bool,
    lifecycle: Mutex<LifecycleState>,
    timer: Mutex<Option<FlushTimer>>,
    disposing: AsyncMutex<()>,
}

impl BatchedStrategy {
    /// Creates the strategy and arms its flush timer.
    ///
    /// Fails when the config is invalid or when called outside a Tokio
    /// runtime.
    pub fn new(
        config: &MeteringConfig,
        reporter: Arc<dyn UsageReporter>,
        resolver: Arc<dyn SubscriptionResolver>,
    ) -> Result<BatchedStrategy, MeteringError> {
        config.validate()?;
        Handle::try_current().map_err(|_| {
            MeteringError::Config(
                "the batched strategy must be created inside a Tokio runtime".to_string(),
            )
        })?;

        let state = Arc::new(BatchState {
            store: Mutex::new(BatchStore::new()),
            flusher: BatchFlusher::new(reporter),
        });
        let timer = FlushTimer::start(
            config.batch_interval(),
            Arc::downgrade(&state),
            |state: Arc<BatchState>| async move {
                state.sweep().await;
            },
        );
        event!(
            Level::INFO,
            interval_ms = config.batch_interval_ms,
            max_batch_size = config.max_batch_size,
            flush_on_dispose = config.flush_on_dispose,
            "Batched usage strategy started."
        );

        Ok(BatchedStrategy {
            state,
            resolver,
            max_batch_size: config.max_batch_size,
            flush_on_dispose: config.flush_on_dispose,
            lifecycle: Mutex::new(LifecycleState::Active),
            timer: Mutex::new(Some(timer)),
            disposing: AsyncMutex::new(()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LifecycleState::Disposed
    }

    fn set_state(&self, state: LifecycleState) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn has_timer(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(FlushTimer::is_running)
    }

    /// Flushes the batch of a single subscription item.
    pub async fn flush_batch(&self, key: &str) -> Result<FlushOutcome, MeteringError> {
        self.state.flusher.flush(&self.state.store, key).await
    }

    /// Flushes every pending batch. Failures are logged, not returned.
    pub async fn flush_all_batches(&self) -> SweepSummary {
        self.state.sweep().await
    }

    pub fn pending_entries(&self, key: &str) -> Vec<UsageEntry> {
        lock_store(&self.state.store).entries(key).to_vec()
    }

    pub fn pending_keys(&self) -> Vec<String> {
        lock_store(&self.state.store).keys()
    }

    async fn resolve(&self, customer_id: &str) -> Result<String, MeteringError> {
        match self.resolver.resolve(customer_id).await {
            Ok(Some(key)) if !key.is_empty() => Ok(key),
            Ok(_) => Err(MeteringError::resolution(customer_id)),
            Err(err) => Err(MeteringError::from_boxed(err)),
        }
    }
}

#[async_trait]
impl UsageStrategy for BatchedStrategy {
    async fn record_usage(
        &self,
        customer_id: &str,
        usage_value: u64,
        endpoint: Option<&str>,
    ) -> Result<(), MeteringError> {
        if self.state() != LifecycleState::Active {
            return Err(MeteringError::Disposed);
        }
        validate_usage(customer_id, usage_value)?;

        let key = self.resolve(customer_id).await?;

        let entry = UsageEntry {
            customer_id: customer_id.to_string(),
            quantity: usage_value,
            endpoint: endpoint.map(str::to_string),
            captured_at_millis: Utc::now().timestamp_millis(),
        };
        let batch_len = {
            let mut store = lock_store(&self.state.store);
            // Disposal leaves Active under the store lock, so an entry
            // appended here is always seen by the final sweep.
            if self.state() != LifecycleState::Active {
                return Err(MeteringError::Disposed);
            }
            store.append(&key, entry)
        };
        event!(
            Level::DEBUG,
            customer_id,
            subscription_item = key.as_str(),
            usage_value,
            batch_len,
            "Usage recorded."
        );

        if batch_len >= self.max_batch_size {
            self.state.flusher.flush(&self.state.store, &key).await?;
        }
        Ok(())
    }

    async fn dispose(&self) {
        let _disposing = self.disposing.lock().await;
        if self.is_disposed() {
            return;
        }
        {
            let _store = lock_store(&self.state.store);
            self.set_state(LifecycleState::Disposing);
        }

        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut timer) = timer {
            timer.stop().await;
        }

        if self.flush_on_dispose {
            let summary = self.state.sweep().await;
            if summary.failed > 0 {
                event!(
                    Level::WARN,
                    failed = summary.failed,
                    "Some usage batches could not be flushed on dispose."
                );
            }
        }

        self.set_state(LifecycleState::Disposed);
        event!(Level::INFO, "Batched usage strategy disposed.");
    }
}
