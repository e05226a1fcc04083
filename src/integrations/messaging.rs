/// Outbound messaging collaborator
///
/// The engine only needs "send this email/SMS to this contact and tell me whether it
/// went out". Provider SDKs live behind an HTTP relay; `DryRunMessaging` stands in
/// when no relay is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageChannel {
    Email,
    Sms,
}

impl MessageChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "EMAIL" => Ok(Self::Email),
            "SMS" => Ok(Self::Sms),
            other => Err(anyhow::anyhow!("Unknown channel: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub user_id: String,
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsMessage {
    pub user_id: String,
    pub to: String,
    pub body: String,
}

/// `{ success, error?, message? }` as reported by the provider
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SendOutcome {
    pub fn sent(message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: None,
        }
    }
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> SendOutcome;
    async fn send_sms(&self, message: &SmsMessage) -> SendOutcome;
}

/// Relays messages to an HTTP gateway: `POST {base}/email`, `POST {base}/sms`
#[derive(Debug, Clone)]
pub struct HttpMessagingProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMessagingProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> SendOutcome {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!("📤 Messaging relay request: POST {}", url);

        let mut request = self.client.post(&url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("❌ Messaging relay unreachable: {}", e);
                return SendOutcome::failed(format!("Messaging relay unreachable: {}", e));
            }
        };

        let status = response.status();
        match response.json::<SendOutcome>().await {
            Ok(outcome) => outcome,
            Err(_) if status.is_success() => SendOutcome::sent(format!("accepted ({})", status)),
            Err(_) => SendOutcome::failed(format!("Messaging relay returned {}", status)),
        }
    }
}

#[async_trait]
impl MessagingProvider for HttpMessagingProvider {
    async fn send_email(&self, message: &EmailMessage) -> SendOutcome {
        self.post(
            "email",
            json!({
                "userId": message.user_id,
                "to": message.to,
                "toName": message.to_name,
                "subject": message.subject,
                "body": message.body,
            }),
        )
        .await
    }

    async fn send_sms(&self, message: &SmsMessage) -> SendOutcome {
        self.post(
            "sms",
            json!({
                "userId": message.user_id,
                "to": message.to,
                "body": message.body,
            }),
        )
        .await
    }
}

/// Logs instead of sending
#[derive(Debug, Clone, Default)]
pub struct DryRunMessaging;

#[async_trait]
impl MessagingProvider for DryRunMessaging {
    async fn send_email(&self, message: &EmailMessage) -> SendOutcome {
        tracing::info!("✉️ [dry-run] email to {}: {}", message.to, message.subject);
        SendOutcome::sent("logged")
    }

    async fn send_sms(&self, message: &SmsMessage) -> SendOutcome {
        tracing::info!("📱 [dry-run] sms to {} ({} chars)", message.to, message.body.len());
        SendOutcome::sent("logged")
    }
}

/// Replace `{{key}}` placeholders with values from `variables`; unknown keys render empty
pub fn render_template(template: &str, variables: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = variables.get(key) {
                    match value {
                        serde_json::Value::String(s) => output.push_str(s),
                        serde_json::Value::Null => {}
                        other => output.push_str(&other.to_string()),
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_render_template_substitutes_known_keys() {
        let rendered = render_template(
            "Hi {{ name }}, your total is {{amount}}.{{missing}}",
            &vars(json!({ "name": "Ana", "amount": 42 })),
        );
        assert_eq!(rendered, "Hi Ana, your total is 42.");
    }

    #[test]
    fn test_render_template_keeps_unterminated_placeholder() {
        assert_eq!(render_template("Hello {{name", &Map::new()), "Hello {{name");
    }

    #[tokio::test]
    async fn test_dry_run_reports_success() {
        let outcome = DryRunMessaging
            .send_sms(&SmsMessage {
                user_id: "u1".to_string(),
                to: "+15550100".to_string(),
                body: "hi".to_string(),
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("logged"));
    }
}
