pub mod accumulator;
pub mod config;
pub mod error;
pub mod flusher;
pub mod reporter;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod strategy;

pub use accumulator::UsageEntry;
pub use config::{MeteringConfig, StrategyKind};
pub use error::{ErrorKind, MeteringError};
pub use reporter::{StripeConfig, StripeReporter, UsageReporter};
pub use resolver::{StaticResolver, SubscriptionResolver};
pub use service::MeteringService;
pub use strategy::{
    create_strategy, BatchedStrategy, ImmediateStrategy, ReportingStrategy, UsageStrategy,
};
