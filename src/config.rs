//! Configuration consumed by the strategy factory.

use crate::error::MeteringError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_METER_EVENT_NAME: &str = "api_requests";

/// The reporting strategies a service can be built with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StrategyKind {
    Immediate,
    Batched,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrategyKind::Immediate => write!(f, "immediate"),
            StrategyKind::Batched => write!(f, "batched"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = MeteringError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "immediate" => Ok(StrategyKind::Immediate),
            "batched" => Ok(StrategyKind::Batched),
            other => Err(MeteringError::Config(format!(
                "unknown strategy type '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeteringConfig {
    /// `"immediate"` or `"batched"`.
    pub strategy_type: String,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub flush_on_dispose: bool,
    /// A random prefix is generated when absent.
    pub idempotency_key_prefix: Option<String>,
    pub meter_event_name: String,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        MeteringConfig {
            strategy_type: StrategyKind::Immediate.to_string(),
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_on_dispose: true,
            idempotency_key_prefix: None,
            meter_event_name: DEFAULT_METER_EVENT_NAME.to_string(),
        }
    }
}

impl MeteringConfig {
    pub fn batched() -> Self {
        MeteringConfig {
            strategy_type: StrategyKind::Batched.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, MeteringError> {
        serde_json::from_str(raw)
            .map_err(|err| MeteringError::Config(format!("malformed metering config: {}", err)))
    }

    pub fn strategy_kind(&self) -> Result<StrategyKind, MeteringError> {
        self.strategy_type.parse()
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Checks the values a batching strategy depends on.
    pub fn validate(&self) -> Result<(), MeteringError> {
        if self.max_batch_size == 0 {
            return Err(MeteringError::Config(
                "maxBatchSize must be at least 1".to_string(),
            ));
        }
        if self.batch_interval_ms == 0 {
            return Err(MeteringError::Config(
                "batchIntervalMs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
