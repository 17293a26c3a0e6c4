//! Mapping from customers to the subscription items usage is billed
//! against. The mapping is supplied by the integrator.

use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// Returns the subscription item key for `customer_id`.
    ///
    /// `Ok(None)` and `Ok(Some(""))` both mean the customer has no
    /// subscription item. Returning a boxed `MeteringError` keeps its
    /// kind; any other error is reported as unknown.
    async fn resolve(&self, customer_id: &str) -> Result<Option<String>, BoxError>;
}

/// Resolver backed by a fixed customer to subscription item table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    items: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(items: HashMap<String, String>) -> Self {
        Self { items }
    }

    pub fn with_item(mut self, customer_id: &str, subscription_item: &str) -> Self {
        self.items
            .insert(customer_id.to_string(), subscription_item.to_string());
        self
    }
}

#[async_trait]
impl SubscriptionResolver for StaticResolver {
    async fn resolve(&self, customer_id: &str) -> Result<Option<String>, BoxError> {
        Ok(self.items.get(customer_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{StaticResolver, SubscriptionResolver};

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::default()
            .with_item("cus_a", "si_1")
            .with_item("cus_b", "si_2");

        assert_eq!(
            resolver.resolve("cus_a").await.unwrap(),
            Some("si_1".to_string())
        );
        assert_eq!(
            resolver.resolve("cus_b").await.unwrap(),
            Some("si_2".to_string())
        );
        assert_eq!(resolver.resolve("cus_missing").await.unwrap(), None);
    }
}
