use super::source::{ChangeEvent, FeedNamespace};
use crate::error::WatchpostError;
use crate::store::ConfigStoreHandle;
use crate::store::models::{DeliveryStatus, Watcher, WebhookMethod};
use crate::store::patch::LogCreate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Canonical payload forwarded to a webhook, one per change event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub watcher: String,
    pub collection: String,
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_description: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub ns: FeedNamespace,
}

impl WebhookPayload {
    pub fn new(watcher: &Watcher, event: &ChangeEvent) -> Self {
        Self {
            watcher: watcher.name.clone(),
            collection: watcher.collection.clone(),
            operation_type: event.operation.as_str().to_string(),
            document_id: event.document_id.clone(),
            full_document: event.full_document.clone(),
            update_description: event.update_description.clone(),
            timestamp: event.emitted_at,
            ns: event.namespace.clone(),
        }
    }

    /// Flattens the payload into query parameters for GET-style delivery.
    /// Nested JSON values are string-encoded.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        fn as_param(v: &Value) -> String {
            match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        }

        let mut pairs = vec![
            ("watcher", self.watcher.clone()),
            ("collection", self.collection.clone()),
            ("operationType", self.operation_type.clone()),
        ];
        if let Some(id) = &self.document_id {
            pairs.push(("documentId", as_param(id)));
        }
        if let Some(doc) = &self.full_document {
            pairs.push(("fullDocument", doc.to_string()));
        }
        if let Some(ud) = &self.update_description {
            pairs.push(("updateDescription", ud.to_string()));
        }
        pairs.push(("timestamp", self.timestamp.to_rfc3339()));
        pairs.push(("ns", json!(self.ns).to_string()));
        pairs
    }
}

/// Sends one HTTP call per change event and records the outcome.
///
/// Exactly one attempt per event, bounded by the client timeout, no retry.
/// Every attempt appends one log entry and bumps the watcher's trigger
/// counter, success or not, so the counter measures attempts made. A failed
/// delivery never reaches back into the feed.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    client: reqwest::Client,
    store: Option<ConfigStoreHandle>,
}

impl DeliveryDispatcher {
    /// `store` is `None` in standalone mode, where outcomes are only traced.
    pub fn new(client: reqwest::Client, store: Option<ConfigStoreHandle>) -> Self {
        Self { client, store }
    }

    pub async fn deliver(&self, watcher: &Watcher, event: &ChangeEvent) -> LogCreate {
        let method = watcher.method();
        let payload = WebhookPayload::new(watcher, event);

        let outcome = self.send(&watcher.webhook_url, method, &payload).await;
        let record = match outcome {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    LogCreate {
                        watcher_id: watcher.id,
                        operation: event.operation,
                        status: DeliveryStatus::Success,
                        message: format!("Sent {} via {}", event.operation, method),
                        response: Some(json!({ "status": status.as_u16() })),
                        error: None,
                        created_at: Utc::now(),
                    }
                } else {
                    // The body is only read (and kept) for the log entry.
                    let body_text = resp.text().await.unwrap_or_default();
                    let body: Value = serde_json::from_str(&body_text)
                        .unwrap_or(Value::String(body_text));
                    LogCreate {
                        watcher_id: watcher.id,
                        operation: event.operation,
                        status: DeliveryStatus::Failure,
                        message: format!("webhook returned HTTP {}", status.as_u16()),
                        response: None,
                        error: Some(json!({ "status": status.as_u16(), "body": body })),
                        created_at: Utc::now(),
                    }
                }
            }
            Err(e) => LogCreate {
                watcher_id: watcher.id,
                operation: event.operation,
                status: DeliveryStatus::Failure,
                message: e.to_string(),
                response: None,
                error: Some(json!({ "message": e.to_string() })),
                created_at: Utc::now(),
            },
        };

        match record.status {
            DeliveryStatus::Success => info!(
                watcher = %watcher.name,
                operation = %event.operation,
                method = %method,
                "delivered change event"
            ),
            DeliveryStatus::Failure => warn!(
                watcher = %watcher.name,
                operation = %event.operation,
                error = %record.message,
                "webhook delivery failed"
            ),
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_log(record.clone()).await {
                warn!(watcher = %watcher.name, error = %e, "failed to record delivery log");
            }
            if let Err(e) = store.increment_trigger_count(watcher.id).await {
                warn!(watcher = %watcher.name, error = %e, "failed to increment trigger count");
            }
        }

        record
    }

    /// One synthetic test call, used by the webhook-test endpoint. Does not
    /// touch the log or the trigger counter.
    pub async fn probe(
        &self,
        url: &str,
        method: WebhookMethod,
    ) -> Result<u16, WatchpostError> {
        let payload = json!({
            "test": true,
            "message": "watchpost webhook test",
            "timestamp": Utc::now(),
        });
        let req = match method {
            WebhookMethod::Get => self
                .client
                .get(url)
                .query(&[("test", "true"), ("message", "watchpost webhook test")]),
            other => self.client.request(http_method(other), url).json(&payload),
        };
        let resp = req
            .send()
            .await
            .map_err(|e| WatchpostError::Delivery(e.to_string()))?;
        Ok(resp.status().as_u16())
    }

    async fn send(
        &self,
        url: &str,
        method: WebhookMethod,
        payload: &WebhookPayload,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let req = match method {
            WebhookMethod::Get => self.client.get(url).query(&payload.query_pairs()),
            other => self.client.request(http_method(other), url).json(payload),
        };
        req.send().await
    }
}

fn http_method(method: WebhookMethod) -> reqwest::Method {
    match method {
        WebhookMethod::Get => reqwest::Method::GET,
        WebhookMethod::Post => reqwest::Method::POST,
        WebhookMethod::Put => reqwest::Method::PUT,
        WebhookMethod::Patch => reqwest::Method::PATCH,
        WebhookMethod::Delete => reqwest::Method::DELETE,
    }
}
