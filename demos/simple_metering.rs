extern crate usage_metering;

use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use usage_metering::{MeteringConfig, MeteringService, StaticResolver, StripeConfig, StripeReporter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stripe secret key
    #[arg(short, long)]
    api_key: String,

    /// Billing API base url, for stripe-mock or a proxy
    #[arg(long)]
    api_base: Option<String>,

    /// Reporting strategy, `immediate` or `batched`
    #[arg(short, long, default_value = "batched")]
    strategy: String,

    /// Customer to subscription item mapping in the cus_x=si_y form
    #[arg(short, long, required = true)]
    item: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let overrides = args
        .api_base
        .map(|base| HashMap::from([("api_base".to_string(), base)]));
    let reporter = StripeReporter::new(StripeConfig::new(&args.api_key, overrides)).unwrap();

    let mut resolver = StaticResolver::default();
    let mut customers = Vec::new();
    for mapping in &args.item {
        let (customer_id, subscription_item) = mapping
            .split_once('=')
            .expect("mappings look like cus_x=si_y");
        resolver = resolver.with_item(customer_id, subscription_item);
        customers.push(customer_id.to_string());
    }

    let config = MeteringConfig {
        strategy_type: args.strategy,
        ..Default::default()
    };
    let service = MeteringService::from_config(&config, Arc::new(reporter), Arc::new(resolver))
        .unwrap();

    for customer_id in &customers {
        service
            .record_usage(customer_id, 1, Some("/v1/search"))
            .await
            .unwrap();
        service
            .record_usage(customer_id, 2, Some("/v1/chat"))
            .await
            .unwrap();
    }

    service.dispose().await;
}
