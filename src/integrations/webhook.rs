/// Outbound webhook collaborator
///
/// WEBHOOK tasks call a tenant-supplied URL with a JSON payload. The sender only
/// reports the HTTP status; deciding that a non-2xx status fails the task is the
/// executor's job.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Methods a WEBHOOK task may use
pub const WEBHOOK_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// `Err` only when no response was received at all
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse>;
}

/// reqwest-backed sender with a per-request timeout
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        tracing::debug!("🌍 Webhook request: {} {}", request.method, request.url);

        let mut builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "PATCH" => self.client.patch(&request.url),
            "DELETE" => self.client.delete(&request.url),
            other => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", other)),
        };
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.method.eq_ignore_ascii_case("GET") {
            builder = builder.json(&request.payload);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))?;

        let status = response.status().as_u16();
        tracing::debug!("📥 Webhook {} answered {}", request.url, status);
        Ok(WebhookResponse { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_2xx_counts_as_success() {
        assert!(WebhookResponse { status: 200 }.is_success());
        assert!(WebhookResponse { status: 204 }.is_success());
        assert!(!WebhookResponse { status: 302 }.is_success());
        assert!(!WebhookResponse { status: 500 }.is_success());
    }

    #[tokio::test]
    async fn test_unsupported_method_is_refused_before_sending() {
        let sender = HttpWebhookSender::new(Duration::from_secs(1)).unwrap();
        let request = WebhookRequest {
            url: "http://127.0.0.1:9/hook".to_string(),
            method: "TRACE".to_string(),
            headers: BTreeMap::new(),
            payload: Value::Null,
        };
        let err = sender.send(&request).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported HTTP method"));
    }
}
