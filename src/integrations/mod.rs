/// External collaborators consumed by the engine
///
/// Messaging (email/SMS), AI (reply drafting, conversation scoring) and outbound
/// webhooks sit behind traits so the engine can be driven by real HTTP clients in
/// production and by in-process fakes in tests.

pub mod ai;
pub mod messaging;
pub mod webhook;

use crate::config::IntegrationsConfig;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

pub use ai::{AiProvider, ConversationInsight, OpenAiProvider, ReplyRequest, UnconfiguredAi};
pub use messaging::{
    DryRunMessaging, EmailMessage, HttpMessagingProvider, MessageChannel, MessagingProvider,
    SendOutcome, SmsMessage,
};
pub use webhook::{HttpWebhookSender, WebhookRequest, WebhookResponse, WebhookSender};

/// The collaborators one engine runs against
#[derive(Clone)]
pub struct Providers {
    pub messaging: Arc<dyn MessagingProvider>,
    pub ai: Arc<dyn AiProvider>,
    pub webhooks: Arc<dyn WebhookSender>,
}

/// Pick concrete providers from configuration
pub fn build_providers(config: &IntegrationsConfig) -> Result<Providers> {
    let messaging: Arc<dyn MessagingProvider> = match &config.messaging_url {
        Some(url) => {
            tracing::info!("📨 Messaging relay: {}", url);
            Arc::new(HttpMessagingProvider::new(url.clone(), config.messaging_token.clone()))
        }
        None => {
            tracing::warn!("📨 No messaging relay configured, messages will only be logged");
            Arc::new(DryRunMessaging)
        }
    };

    let ai: Arc<dyn AiProvider> = match (&config.ai_url, &config.ai_api_key) {
        (Some(url), Some(key)) => {
            tracing::info!("🤖 AI provider: {} ({})", url, config.ai_model);
            Arc::new(OpenAiProvider::new(url.clone(), key.clone(), config.ai_model.clone()))
        }
        _ => {
            tracing::warn!("🤖 No AI provider configured, AI tasks will fail");
            Arc::new(UnconfiguredAi)
        }
    };

    let webhooks: Arc<dyn WebhookSender> =
        Arc::new(HttpWebhookSender::new(Duration::from_secs(config.webhook_timeout_secs))?);

    Ok(Providers { messaging, ai, webhooks })
}
