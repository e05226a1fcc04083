/// AI collaborator
///
/// Two capabilities are consumed by workflow tasks: drafting a reply to a contact,
/// and classifying a conversation into sentiment/outcome with a lead score delta.
/// `OpenAiProvider` speaks the chat-completions API; `UnconfiguredAi` fails loudly
/// so a task that needs AI is marked failed instead of silently skipped.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    pub user_id: String,
    /// Fully rendered instruction for the model
    pub prompt: String,
    /// Contact/trigger variables passed along as context
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Classification of one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInsight {
    pub sentiment: Sentiment,
    /// Free-form outcome label, e.g. "INTERESTED", "BOOKED", "NOT_INTERESTED"
    pub outcome: String,
    /// Adjustment to apply to the lead score
    pub score_delta: i64,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate_reply(&self, request: &ReplyRequest) -> Result<String>;
    async fn analyze_conversation(&self, transcript: &str) -> Result<ConversationInsight>;
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

const ANALYSIS_INSTRUCTIONS: &str = "Classify the sales conversation. Respond with JSON only: \
{\"sentiment\": \"POSITIVE|NEUTRAL|NEGATIVE\", \"outcome\": \"<SHORT_LABEL>\", \"scoreDelta\": <integer between -20 and 20>}";

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        tracing::debug!("🤖 AI request: POST {} (model: {})", url, self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("AI request failed: {}", e))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read AI response: {}", e))?;

        if !status.is_success() {
            let reason = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(anyhow::anyhow!("AI provider returned {}: {}", status, reason));
        }

        body.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("AI response had no message content"))
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    async fn generate_reply(&self, request: &ReplyRequest) -> Result<String> {
        let system = format!(
            "You write short, friendly business replies on behalf of a CRM user. Contact context: {}",
            request.context
        );
        self.chat(&system, &request.prompt).await
    }

    async fn analyze_conversation(&self, transcript: &str) -> Result<ConversationInsight> {
        let raw = self.chat(ANALYSIS_INSTRUCTIONS, transcript).await?;
        parse_insight(&raw)
    }
}

/// Accepts bare JSON or JSON wrapped in a fenced code block
pub fn parse_insight(raw: &str) -> Result<ConversationInsight> {
    let trimmed = raw.trim();
    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Err(anyhow::anyhow!("AI analysis was not JSON: {}", trimmed)),
    };
    serde_json::from_str(json_text)
        .map_err(|e| anyhow::anyhow!("AI analysis had unexpected shape: {}", e))
}

/// Placeholder when no AI endpoint is configured
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredAi;

#[async_trait]
impl AiProvider for UnconfiguredAi {
    async fn generate_reply(&self, _request: &ReplyRequest) -> Result<String> {
        Err(anyhow::anyhow!("AI provider is not configured"))
    }

    async fn analyze_conversation(&self, _transcript: &str) -> Result<ConversationInsight> {
        Err(anyhow::anyhow!("AI provider is not configured"))
    }
}
