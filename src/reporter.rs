//! This module provides an abstraction over the billing backend so
//! that strategies can report usage without depending on a concrete
//! HTTP client.
//!
//! `StripeReporter` is the production implementation. Tests use the
//! in-crate `DummyReporter`, which records every call.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{event, Level};

static DEFAULT_API_BASE: &str = "https://api.stripe.com";
static DEFAULT_METER_EVENT_PATH: &str = "/v1/billing/meter_events";

/// This structure wraps the parameters to initialize a Stripe reporter.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    api_key: String,
    config_map: HashMap<String, String>,
}

impl StripeConfig {
    /// Recognized overrides are `api_base` and `meter_event_path`.
    pub fn new(api_key: &str, override_params: Option<HashMap<String, String>>) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("api_base".to_string(), DEFAULT_API_BASE.to_string());
        config_map.insert(
            "meter_event_path".to_string(),
            DEFAULT_METER_EVENT_PATH.to_string(),
        );

        let config = Self {
            api_key: api_key.to_string(),
            config_map,
        };

        apply_override_params(config, override_params)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_base(&self) -> &str {
        self.get("api_base")
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
    }

    pub fn meter_event_path(&self) -> &str {
        self.get("meter_event_path")
            .unwrap_or(DEFAULT_METER_EVENT_PATH)
    }

    pub fn get(&self, param: &str) -> Option<&str> {
        self.config_map.get(param).map(String::as_str)
    }
}

fn apply_override_params<V>(
    mut config: StripeConfig,
    override_params: Option<HashMap<String, V>>,
) -> StripeConfig
where
    V: Into<String>,
{
    if let Some(params) = override_params {
        for (param, value) in params {
            config.config_map.insert(param, value.into());
        }
    }
    config
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    Increment,
}

/// Aggregated usage for one subscription item. Serializes to the form
/// body of a usage record request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UsageRecord {
    /// Part of the request path, not the body.
    #[serde(skip)]
    pub subscription_item: String,
    pub quantity: u64,
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub action: UsageAction,
}

/// A single usage event attributed to a customer, sent without batching.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MeterEvent {
    pub event_name: String,
    pub customer_id: String,
    pub value: u64,
    pub timestamp: i64,
    /// Lets the backend deduplicate retried submissions.
    pub identifier: String,
    pub metadata: BTreeMap<String, String>,
}

/// Billing backend errors.
#[derive(Error, Debug)]
pub enum ReporterError {
    /// The backend answered with an error.
    #[error("billing backend error: {message}")]
    Api {
        code: Option<String>,
        status: Option<u16>,
        message: String,
    },

    /// The request never got a response.
    #[error("failed to reach billing backend")]
    Transport(#[source] reqwest::Error),

    /// Failed to create the HTTP client.
    #[error("failed to create billing client: invalid configuration")]
    InvalidConfig(#[source] reqwest::Error),
}

impl ReporterError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ReporterError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ReporterError::Api { status, .. } => *status,
            ReporterError::Transport(err) => err.status().map(|s| s.as_u16()),
            ReporterError::InvalidConfig(_) => None,
        }
    }
}

/// The billing backend as seen by the strategies.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Submits an aggregated quantity for a subscription item.
    async fn report_usage(&self, record: &UsageRecord) -> Result<(), ReporterError>;

    /// Submits a single customer level usage event.
    async fn send_meter_event(&self, event: &MeterEvent) -> Result<(), ReporterError>;
}

#[derive(Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Deserialize)]
struct StripeErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

pub struct StripeReporter {
    client: reqwest::Client,
    config: StripeConfig,
}

impl StripeReporter {
    pub fn new(config: StripeConfig) -> Result<StripeReporter, ReporterError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ReporterError::InvalidConfig)?;
        Ok(StripeReporter { client, config })
    }

    async fn post_form<T: Serialize + ?Sized>(
        &self,
        url: String,
        form: &T,
        idempotency_key: Option<&str>,
    ) -> Result<(), ReporterError> {
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key())
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(ReporterError::Transport)?;
        let status = response.status();
        if status.is_success() {
            event!(Level::DEBUG, %url, status = status.as_u16(), "Billing request accepted.");
            return Ok(());
        }

        let body = response.text().await.map_err(ReporterError::Transport)?;
        let err = api_error(status, &body);
        event!(Level::WARN, %url, status = status.as_u16(), "Billing request rejected. {}", err);
        Err(err)
    }
}

fn api_error(status: StatusCode, body: &str) -> ReporterError {
    match serde_json::from_str::<StripeErrorBody>(body) {
        Ok(parsed) => ReporterError::Api {
            code: parsed.error.code,
            status: Some(status.as_u16()),
            message: parsed
                .error
                .message
                .unwrap_or_else(|| status.to_string()),
        },
        Err(_) => ReporterError::Api {
            code: None,
            status: Some(status.as_u16()),
            message: if body.is_empty() {
                status.to_string()
            } else {
                body.to_string()
            },
        },
    }
}

#[async_trait]
impl UsageReporter for StripeReporter {
    async fn report_usage(&self, record: &UsageRecord) -> Result<(), ReporterError> {
        let url = format!(
            "{}/v1/subscription_items/{}/usage_records",
            self.config.api_base(),
            record.subscription_item
        );
        self.post_form(url, record, None).await
    }

    async fn send_meter_event(&self, event: &MeterEvent) -> Result<(), ReporterError> {
        let url = format!(
            "{}{}",
            self.config.api_base(),
            self.config.meter_event_path()
        );
        let mut form = vec![
            ("event_name".to_string(), event.event_name.clone()),
            ("identifier".to_string(), event.identifier.clone()),
            ("timestamp".to_string(), event.timestamp.to_string()),
            (
                "payload[stripe_customer_id]".to_string(),
                event.customer_id.clone(),
            ),
            ("payload[value]".to_string(), event.value.to_string()),
        ];
        for (key, value) in &event.metadata {
            form.push((format!("payload[{}]", key), value.clone()));
        }
        self.post_form(url, form.as_slice(), Some(event.identifier.as_str()))
            .await
    }
}

#[cfg(test)]
use std::collections::HashSet;
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use tokio::sync::Notify;

/// Records every accepted submission in `records`. Items listed in
/// `failing_items` are rejected with a `resource_missing` error and
/// `fail_meter_events` rejects meter events with a 402.
///
/// Every usage record is also pushed to `submitted` on arrival and
/// signals `arrived`. When `release` is set, the call then waits for one
/// notification on it before answering.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct DummyReporter {
    pub records: Arc<Mutex<Vec<UsageRecord>>>,
    pub submitted: Arc<Mutex<Vec<UsageRecord>>>,
    pub events: Arc<Mutex<Vec<MeterEvent>>>,
    pub failing_items: Arc<Mutex<HashSet<String>>>,
    pub fail_meter_events: bool,
    pub arrived: Arc<Notify>,
    pub release: Option<Arc<Notify>>,
}

#[cfg(test)]
impl DummyReporter {
    pub fn fail_item(&self, subscription_item: &str) {
        self.failing_items
            .lock()
            .unwrap()
            .insert(subscription_item.to_string());
    }

    pub fn recover_item(&self, subscription_item: &str) {
        self.failing_items.lock().unwrap().remove(subscription_item);
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<UsageRecord> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<MeterEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl UsageReporter for DummyReporter {
    async fn report_usage(&self, record: &UsageRecord) -> Result<(), ReporterError> {
        self.submitted.lock().unwrap().push(record.clone());
        self.arrived.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if self
            .failing_items
            .lock()
            .unwrap()
            .contains(&record.subscription_item)
        {
            return Err(ReporterError::Api {
                code: Some("resource_missing".to_string()),
                status: Some(404),
                message: format!("No such subscription item: {}", record.subscription_item),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn send_meter_event(&self, event: &MeterEvent) -> Result<(), ReporterError> {
        if self.fail_meter_events {
            return Err(ReporterError::Api {
                code: Some("card_declined".to_string()),
                status: Some(402),
                message: "Your card was declined.".to_string(),
            });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MeterEvent, ReporterError, StripeConfig, StripeReporter, UsageAction, UsageRecord,
        UsageReporter,
    };
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reporter_for(server: &MockServer) -> StripeReporter {
        let config = StripeConfig::new(
            "sk_test_123",
            Some(HashMap::from([("api_base".to_string(), server.uri())])),
        );
        StripeReporter::new(config).unwrap()
    }

    fn record() -> UsageRecord {
        UsageRecord {
            subscription_item: "si_1".to_string(),
            quantity: 3,
            timestamp: 1_696_803_325,
            action: UsageAction::Increment,
        }
    }

    #[test]
    fn test_build_stripe_configuration() {
        let config = StripeConfig::new(
            "sk_test_123",
            Some(HashMap::from([(
                "api_base".to_string(),
                "http://localhost:12111/".to_string(),
            )])),
        );
        assert_eq!(config.api_base(), "http://localhost:12111");
        assert_eq!(config.meter_event_path(), "/v1/billing/meter_events");
        assert_eq!(config.api_key(), "sk_test_123");

        let defaults = StripeConfig::new("sk_test_123", None);
        assert_eq!(defaults.api_base(), "https://api.stripe.com");
    }

    #[test]
    fn test_usage_record_serde() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(
            json,
            json!({"quantity": 3, "timestamp": 1_696_803_325, "action": "increment"})
        );
    }

    #[tokio::test]
    async fn test_report_usage_posts_usage_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscription_items/si_1/usage_records"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains("quantity=3"))
            .and(body_string_contains("action=increment"))
            .and(body_string_contains("timestamp=1696803325"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "mbur_1",
                "object": "usage_record",
                "quantity": 3,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter_for(&server);
        reporter.report_usage(&record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_structured_error_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {
                    "code": "resource_missing",
                    "message": "No such subscription item: 'si_1'",
                    "type": "invalid_request_error",
                }
            })))
            .mount(&server)
            .await;

        let reporter = reporter_for(&server);
        let err = reporter.report_usage(&record()).await.unwrap_err();
        assert_eq!(err.code(), Some("resource_missing"));
        assert_eq!(err.status_code(), Some(404));
        assert!(err.to_string().contains("No such subscription item"));
    }

    #[tokio::test]
    async fn test_unstructured_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let reporter = reporter_for(&server);
        let err = reporter.report_usage(&record()).await.unwrap_err();
        match err {
            ReporterError::Api {
                code,
                status,
                message,
            } => {
                assert_eq!(code, None);
                assert_eq!(status, Some(502));
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_meter_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/billing/meter_events"))
            .and(header("idempotency-key", "req-cus_1-1-0"))
            .and(body_string_contains("event_name=api_requests"))
            .and(body_string_contains("payload%5Bstripe_customer_id%5D=cus_1"))
            .and(body_string_contains("payload%5Bvalue%5D=2"))
            .and(body_string_contains("payload%5Bendpoint%5D=%2Fv1%2Fsearch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter_for(&server);
        let event = MeterEvent {
            event_name: "api_requests".to_string(),
            customer_id: "cus_1".to_string(),
            value: 2,
            timestamp: 1,
            identifier: "req-cus_1-1-0".to_string(),
            metadata: BTreeMap::from([("endpoint".to_string(), "/v1/search".to_string())]),
        };
        reporter.send_meter_event(&event).await.unwrap();
    }
}
