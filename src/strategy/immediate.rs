//! The immediate strategy: one backend call per recorded usage, no
//! internal store and no timer.

use crate::config::MeteringConfig;
use crate::error::MeteringError;
use crate::reporter::{MeterEvent, UsageReporter};
use crate::strategy::{validate_usage, UsageStrategy};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{event, Level};
use uuid::Uuid;

/// Endpoint label sent when the caller did not provide one.
pub const DEFAULT_ENDPOINT_LABEL: &str = "unknown";

pub struct ImmediateStrategy {
    reporter: Arc<dyn UsageReporter>,
    idempotency_prefix: String,
    meter_event_name: String,
    sequence: AtomicU64,
    disposed: AtomicBool,
}

impl ImmediateStrategy {
    pub fn new(config: &MeteringConfig, reporter: Arc<dyn UsageReporter>) -> Self {
        let idempotency_prefix = config
            .idempotency_key_prefix
            .clone()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        ImmediateStrategy {
            reporter,
            idempotency_prefix,
            meter_event_name: config.meter_event_name.clone(),
            sequence: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn idempotency_prefix(&self) -> &str {
        &self.idempotency_prefix
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Unique per call, even for calls within the same millisecond.
    fn idempotency_key(&self, customer_id: &str, timestamp_millis: i64) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{}",
            self.idempotency_prefix, customer_id, timestamp_millis, sequence
        )
    }
}

#[async_trait]
impl UsageStrategy for ImmediateStrategy {
    async fn record_usage(
        &self,
        customer_id: &str,
        usage_value: u64,
        endpoint: Option<&str>,
    ) -> Result<(), MeteringError> {
        if self.is_disposed() {
            return Err(MeteringError::Disposed);
        }
        validate_usage(customer_id, usage_value)?;

        let now = Utc::now();
        let meter_event = MeterEvent {
            event_name: self.meter_event_name.clone(),
            customer_id: customer_id.to_string(),
            value: usage_value,
            timestamp: now.timestamp(),
            identifier: self.idempotency_key(customer_id, now.timestamp_millis()),
            metadata: BTreeMap::from([(
                "endpoint".to_string(),
                endpoint.unwrap_or(DEFAULT_ENDPOINT_LABEL).to_string(),
            )]),
        };

        self.reporter
            .send_meter_event(&meter_event)
            .await
            .map_err(|source| {
                MeteringError::backend(
                    format!("Failed to report usage for customer {}", customer_id),
                    None,
                    source,
                )
            })?;
        event!(
            Level::DEBUG,
            customer_id,
            usage_value,
            identifier = meter_event.identifier.as_str(),
            "Usage reported."
        );
        Ok(())
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            event!(Level::INFO, "Immediate usage strategy disposed.");
        }
    }
}
