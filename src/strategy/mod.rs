//! Reporting strategies.
//!
//! There are exactly two: `immediate` sends one backend call per recorded
//! usage, `batched` accumulates usage per subscription item and flushes
//! on size, on a timer and on disposal. [`create_strategy`] picks one
//! from a [`MeteringConfig`].

pub mod batched;
pub mod immediate;

pub use batched::{BatchedStrategy, LifecycleState};
pub use immediate::ImmediateStrategy;

use crate::config::{MeteringConfig, StrategyKind};
use crate::error::MeteringError;
use crate::reporter::UsageReporter;
use crate::resolver::SubscriptionResolver;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{event, Level};

#[async_trait]
pub trait UsageStrategy: Send + Sync {
    async fn record_usage(
        &self,
        customer_id: &str,
        usage_value: u64,
        endpoint: Option<&str>,
    ) -> Result<(), MeteringError>;

    /// Releases whatever the strategy holds. Never fails.
    ///
    /// Strategies without anything to release keep this default.
    async fn dispose(&self) {}
}

/// Rejects an empty customer id or a zero usage value.
pub fn validate_usage(customer_id: &str, usage_value: u64) -> Result<(), MeteringError> {
    if customer_id.is_empty() {
        return Err(MeteringError::invalid_input("customer id is required"));
    }
    if usage_value == 0 {
        return Err(MeteringError::invalid_input(
            "usage value must be greater than zero",
        ));
    }
    Ok(())
}

pub enum ReportingStrategy {
    Immediate(ImmediateStrategy),
    Batched(BatchedStrategy),
}

impl ReportingStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ReportingStrategy::Immediate(_) => StrategyKind::Immediate,
            ReportingStrategy::Batched(_) => StrategyKind::Batched,
        }
    }

    pub fn as_batched(&self) -> Option<&BatchedStrategy> {
        match self {
            ReportingStrategy::Batched(strategy) => Some(strategy),
            ReportingStrategy::Immediate(_) => None,
        }
    }
}

#[async_trait]
impl UsageStrategy for ReportingStrategy {
    async fn record_usage(
        &self,
        customer_id: &str,
        usage_value: u64,
        endpoint: Option<&str>,
    ) -> Result<(), MeteringError> {
        match self {
            ReportingStrategy::Immediate(strategy) => {
                strategy
                    .record_usage(customer_id, usage_value, endpoint)
                    .await
            }
            ReportingStrategy::Batched(strategy) => {
                strategy
                    .record_usage(customer_id, usage_value, endpoint)
                    .await
            }
        }
    }

    async fn dispose(&self) {
        match self {
            ReportingStrategy::Immediate(strategy) => strategy.dispose().await,
            ReportingStrategy::Batched(strategy) => strategy.dispose().await,
        }
    }
}

/// Builds the strategy named by `config.strategy_type`.
///
/// The resolver is only used by the batched strategy. Unknown strategy
/// tags and invalid batching settings are configuration errors.
pub fn create_strategy(
    config: &MeteringConfig,
    reporter: Arc<dyn UsageReporter>,
    resolver: Arc<dyn SubscriptionResolver>,
) -> Result<ReportingStrategy, MeteringError> {
    let kind = config.strategy_kind()?;
    let strategy = match kind {
        StrategyKind::Immediate => {
            ReportingStrategy::Immediate(ImmediateStrategy::new(config, reporter))
        }
        StrategyKind::Batched => {
            ReportingStrategy::Batched(BatchedStrategy::new(config, reporter, resolver)?)
        }
    };
    event!(Level::INFO, strategy = %kind, "Usage reporting strategy created.");
    Ok(strategy)
}
