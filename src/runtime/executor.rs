/// Task action handlers
///
/// Runs one task's action against its instance: messaging sends, AI reply drafting
/// and conversation scoring, outbound webhooks, owner notifications and waits. The advancer decides
/// *when* a task runs; this module only decides *what running it means*.

use crate::events::{EngineEvent, EventKind, EventLog};
use crate::integrations::{
    messaging::render_template, AiProvider, EmailMessage, MessageChannel, MessagingProvider,
    ReplyRequest, SmsMessage, WebhookRequest, WebhookSender,
};
use crate::workflow::types::{TaskAction, WorkflowInstance, WorkflowTask};
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Executes task actions through the configured collaborators
pub struct TaskExecutor {
    messaging: Arc<dyn MessagingProvider>,
    ai: Arc<dyn AiProvider>,
    webhooks: Arc<dyn WebhookSender>,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor").finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub fn new(
        messaging: Arc<dyn MessagingProvider>,
        ai: Arc<dyn AiProvider>,
        webhooks: Arc<dyn WebhookSender>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            messaging,
            ai,
            webhooks,
            events,
        }
    }

    /// Run `task` for `instance`, returning the JSON result stored on the execution.
    /// An `Err` marks the execution (and its instance) failed.
    pub async fn execute_task(&self, task: &WorkflowTask, instance: &WorkflowInstance) -> Result<Value> {
        tracing::info!("🚀 Running task {} ({}) for instance {}", task.name, task.id, instance.id);
        let start_time = std::time::Instant::now();

        let variables = instance.variables.as_object().cloned().unwrap_or_default();

        let result = match &task.action {
            TaskAction::SendEmail { subject, body } => {
                let subject = render_template(subject, &variables);
                let body = render_template(body, &variables);
                self.deliver(instance, MessageChannel::Email, Some(subject), body, &variables).await
            }
            TaskAction::SendSms { body } => {
                let body = render_template(body, &variables);
                self.deliver(instance, MessageChannel::Sms, None, body, &variables).await
            }
            TaskAction::AiReply { prompt, channel, subject } => {
                self.ai_reply(instance, prompt, *channel, subject.as_deref(), &variables).await
            }
            TaskAction::ScoreConversation { transcript_var } => {
                self.score_conversation(transcript_var, &variables).await
            }
            TaskAction::Wait => Ok(json!({ "waited": task.delay_minutes })),
            TaskAction::NotifyOwner { message } => {
                let message = render_template(message, &variables);
                self.events.record(
                    EngineEvent::new(EventKind::OwnerNotified, message.clone())
                        .for_user(&instance.user_id)
                        .instance(&instance.id),
                );
                Ok(json!({ "notified": true, "message": message }))
            }
            TaskAction::Webhook {
                url,
                method,
                headers,
                payload,
            } => self.webhook(instance, url, method, headers, payload.as_ref()).await,
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(_) => tracing::info!("✅ Task {} completed in {:?}", task.id, duration),
            Err(e) => tracing::error!("❌ Task {} failed in {:?}: {}", task.id, duration, e),
        }

        result
    }

    async fn deliver(
        &self,
        instance: &WorkflowInstance,
        channel: MessageChannel,
        subject: Option<String>,
        body: String,
        variables: &Map<String, Value>,
    ) -> Result<Value> {
        let outcome = match channel {
            MessageChannel::Email => {
                let to = contact_field(variables, &["email", "contactEmail"])
                    .ok_or_else(|| anyhow::anyhow!("No email address for contact"))?;
                let message = EmailMessage {
                    user_id: instance.user_id.clone(),
                    to,
                    to_name: contact_field(variables, &["name", "contactName"]),
                    subject: subject.unwrap_or_default(),
                    body,
                };
                self.messaging.send_email(&message).await
            }
            MessageChannel::Sms => {
                let to = contact_field(variables, &["phone", "contactPhone"])
                    .ok_or_else(|| anyhow::anyhow!("No phone number for contact"))?;
                let message = SmsMessage {
                    user_id: instance.user_id.clone(),
                    to,
                    body,
                };
                self.messaging.send_sms(&message).await
            }
        };

        if !outcome.success {
            return Err(anyhow::anyhow!(
                "{} send failed: {}",
                channel.as_str(),
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }

        Ok(json!({
            "channel": channel,
            "sent": true,
            "providerMessage": outcome.message,
        }))
    }

    async fn ai_reply(
        &self,
        instance: &WorkflowInstance,
        prompt: &str,
        channel: MessageChannel,
        subject: Option<&str>,
        variables: &Map<String, Value>,
    ) -> Result<Value> {
        let request = ReplyRequest {
            user_id: instance.user_id.clone(),
            prompt: render_template(prompt, variables),
            context: Value::Object(variables.clone()),
        };
        let reply = self.ai.generate_reply(&request).await?;
        if reply.trim().is_empty() {
            return Err(anyhow::anyhow!("AI returned an empty reply"));
        }

        let subject = subject.map(|s| render_template(s, variables));
        let mut result = self
            .deliver(instance, channel, subject, reply.clone(), variables)
            .await?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("reply".to_string(), Value::String(reply));
        }
        Ok(result)
    }

    async fn score_conversation(&self, transcript_var: &str, variables: &Map<String, Value>) -> Result<Value> {
        let transcript = variables
            .get(transcript_var)
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No conversation found in variable '{}'", transcript_var))?;

        let insight = self.ai.analyze_conversation(transcript).await?;
        tracing::debug!("📊 Conversation scored: {:?}", insight);
        Ok(serde_json::to_value(insight)?)
    }

    async fn webhook(
        &self,
        instance: &WorkflowInstance,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
        payload: Option<&Value>,
    ) -> Result<Value> {
        let mut body = match payload {
            Some(Value::Object(fields)) => fields.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                let mut wrapped = Map::new();
                wrapped.insert("data".to_string(), other.clone());
                wrapped
            }
        };
        body.insert("leadId".to_string(), json!(instance.lead_id));
        body.insert("dealId".to_string(), json!(instance.deal_id));
        body.insert("userId".to_string(), json!(instance.user_id));
        body.insert("instanceId".to_string(), json!(instance.id));
        body.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));

        let request = WebhookRequest {
            url: url.to_string(),
            method: method.to_uppercase(),
            headers: headers.clone(),
            payload: Value::Object(body),
        };
        let response = self.webhooks.send(&request).await?;
        if !response.is_success() {
            return Err(anyhow::anyhow!("Webhook {} answered {}", url, response.status));
        }

        Ok(json!({ "webhook": url, "status": response.status }))
    }
}

fn contact_field(variables: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| variables.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}
