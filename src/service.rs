use crate::config::MeteringConfig;
use crate::error::MeteringError;
use crate::reporter::UsageReporter;
use crate::resolver::SubscriptionResolver;
use crate::strategy::{create_strategy, validate_usage, ReportingStrategy, UsageStrategy};
use std::sync::Arc;

/// This is the entry point for the library. It is in most cases
/// everything you need to meter your API.
///
/// The MeteringService wraps one reporting strategy. Immediate
/// strategies send every call to the billing backend, batched ones
/// accumulate usage per subscription item and flush it periodically.
///
/// Batched strategies own a background flush timer, so a service should
/// be created once per application and disposed on shutdown. Avoid
/// creating a MeteringService every time some usage needs to be recorded.
pub struct MeteringService<S = ReportingStrategy> {
    strategy: S,
}

impl MeteringService<ReportingStrategy> {
    /// Builds the strategy selected by `config` and wraps it.
    pub fn from_config(
        config: &MeteringConfig,
        reporter: Arc<dyn UsageReporter>,
        resolver: Arc<dyn SubscriptionResolver>,
    ) -> Result<Self, MeteringError> {
        Ok(MeteringService::new(create_strategy(
            config, reporter, resolver,
        )?))
    }
}

impl<S: UsageStrategy> MeteringService<S> {
    /// Leaves the responsibility to provide a strategy to the client.
    pub fn new(strategy: S) -> Self {
        MeteringService { strategy }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Records an amount of usage for a customer.
    ///
    /// Input is checked here as well as in the strategy, since custom
    /// strategies may skip the check. Strategy failures come back wrapped
    /// in `MeteringError::Service` with their kind, code and status intact.
    pub async fn record_usage(
        &self,
        customer_id: &str,
        usage_value: u64,
        endpoint: Option<&str>,
    ) -> Result<(), MeteringError> {
        validate_usage(customer_id, usage_value)?;
        self.strategy
            .record_usage(customer_id, usage_value, endpoint)
            .await
            .map_err(|err| MeteringError::Service(Box::new(err)))
    }

    /// Disposes the strategy. This method should be called when the
    /// application is about to shut down. It never fails.
    pub async fn dispose(&self) {
        self.strategy.dispose().await
    }
}
