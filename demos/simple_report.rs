extern crate usage_metering;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use usage_metering::reporter::{UsageAction, UsageRecord};
use usage_metering::{StripeConfig, StripeReporter, UsageReporter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stripe secret key
    #[arg(short, long)]
    api_key: String,

    /// Subscription item to report usage for
    #[arg(short, long)]
    subscription_item: String,

    /// Quantity to add
    #[arg(short, long, default_value_t = 1)]
    quantity: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let reporter = StripeReporter::new(StripeConfig::new(&args.api_key, None)).unwrap();
    let record = UsageRecord {
        subscription_item: args.subscription_item,
        quantity: args.quantity,
        timestamp: Utc::now().timestamp(),
        action: UsageAction::Increment,
    };

    if let Err(err) = reporter.report_usage(&record).await {
        eprintln!("{}", err);
    }
}
