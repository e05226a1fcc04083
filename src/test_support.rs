//! Shared fixtures and collaborator fakes for unit tests

use crate::db::Database;
use crate::drip::{DripScheduler, DripStorage};
use crate::events::EventLog;
use crate::integrations::ai::{ConversationInsight, ReplyRequest, Sentiment};
use crate::integrations::{
    AiProvider, EmailMessage, MessagingProvider, Providers, SendOutcome, SmsMessage, WebhookRequest,
    WebhookResponse, WebhookSender,
};
use crate::runtime::{executor::TaskExecutor, hitl::HitlGate, WorkflowEngine};
use crate::workflow::conditions::TriggerConfig;
use crate::workflow::types::{
    EnrollmentMode, InstanceStatus, TaskAction, TriggerType, WorkflowInstance, WorkflowTask, WorkflowTemplate,
};
use crate::workflow::{TriggerRegistry, WorkflowStorage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Messaging fake that records every successful send
#[derive(Debug, Default)]
pub struct RecordingMessaging {
    emails: Mutex<Vec<EmailMessage>>,
    sms: Mutex<Vec<SmsMessage>>,
    failure: Mutex<Option<String>>,
}

impl RecordingMessaging {
    pub fn failing(error: &str) -> Self {
        let messaging = Self::default();
        messaging.fail_with(error);
        messaging
    }

    pub fn fail_with(&self, error: &str) {
        *self.failure.lock().unwrap() = Some(error.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn emails(&self) -> Vec<EmailMessage> {
        self.emails.lock().unwrap().clone()
    }

    pub fn sms(&self) -> Vec<SmsMessage> {
        self.sms.lock().unwrap().clone()
    }

    fn outcome(&self) -> Option<SendOutcome> {
        self.failure.lock().unwrap().clone().map(SendOutcome::failed)
    }
}

#[async_trait]
impl MessagingProvider for RecordingMessaging {
    async fn send_email(&self, message: &EmailMessage) -> SendOutcome {
        if let Some(failed) = self.outcome() {
            return failed;
        }
        self.emails.lock().unwrap().push(message.clone());
        SendOutcome::sent("recorded")
    }

    async fn send_sms(&self, message: &SmsMessage) -> SendOutcome {
        if let Some(failed) = self.outcome() {
            return failed;
        }
        self.sms.lock().unwrap().push(message.clone());
        SendOutcome::sent("recorded")
    }
}

/// AI fake with canned answers
#[derive(Debug)]
pub struct ScriptedAi {
    reply: String,
    insight: ConversationInsight,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedAi {
    fn default() -> Self {
        Self {
            reply: "Thanks, we will be in touch.".to_string(),
            insight: ConversationInsight {
                sentiment: Sentiment::Neutral,
                outcome: "UNKNOWN".to_string(),
                score_delta: 0,
            },
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAi {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            ..Self::default()
        }
    }

    pub fn scoring(sentiment: Sentiment, outcome: &str, score_delta: i64) -> Self {
        Self {
            insight: ConversationInsight {
                sentiment,
                outcome: outcome.to_string(),
                score_delta,
            },
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiProvider for ScriptedAi {
    async fn generate_reply(&self, request: &ReplyRequest) -> Result<String> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(self.reply.clone())
    }

    async fn analyze_conversation(&self, _transcript: &str) -> Result<ConversationInsight> {
        Ok(self.insight.clone())
    }
}

/// Webhook fake that records requests and answers with a fixed status
#[derive(Debug)]
pub struct RecordingWebhooks {
    status: Option<u16>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl Default for RecordingWebhooks {
    fn default() -> Self {
        Self::answering(200)
    }
}

impl RecordingWebhooks {
    pub fn answering(status: u16) -> Self {
        Self {
            status: Some(status),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request fails without a response
    pub fn unreachable() -> Self {
        Self {
            status: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookSender for RecordingWebhooks {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match self.status {
            Some(status) => Ok(WebhookResponse { status }),
            None => Err(anyhow::anyhow!("connection refused")),
        }
    }
}

/// Recording fakes bundled for `server::build_state`
pub fn fake_providers(messaging: Arc<RecordingMessaging>, ai: Arc<ScriptedAi>) -> Providers {
    Providers {
        messaging,
        ai,
        webhooks: Arc::new(RecordingWebhooks::default()),
    }
}

/// Enabled DEAL_CREATED template with one WAIT task per `(display_order, is_hitl)`
pub fn template_fixture(user_id: &str, tasks: &[(i64, bool)]) -> WorkflowTemplate {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    WorkflowTemplate {
        id: id.clone(),
        user_id: user_id.to_string(),
        name: "Deal follow-up".to_string(),
        description: None,
        trigger_types: vec![TriggerType::DealCreated],
        trigger_config: TriggerConfig::default(),
        enrollment_mode: EnrollmentMode::default(),
        enabled: true,
        tasks: tasks
            .iter()
            .map(|&(display_order, is_hitl)| WorkflowTask {
                id: Uuid::new_v4().to_string(),
                template_id: id.clone(),
                name: format!("Task {}", display_order),
                display_order,
                is_hitl,
                delay_minutes: 0,
                action: TaskAction::Wait,
                run_if: Vec::new(),
            })
            .collect(),
        created_at: now,
        updated_at: now,
    }
}

/// RUNNING instance of `template`
pub fn instance_fixture(template: &WorkflowTemplate, lead_id: Option<&str>) -> WorkflowInstance {
    let now = Utc::now();
    WorkflowInstance {
        id: Uuid::new_v4().to_string(),
        template_id: template.id.clone(),
        user_id: template.user_id.clone(),
        lead_id: lead_id.map(str::to_string),
        deal_id: None,
        status: InstanceStatus::Running,
        trigger_type: TriggerType::DealCreated,
        variables: json!({}),
        started_at: now,
        updated_at: now,
        completed_at: None,
    }
}

/// Fully wired engine over an in-memory database
pub struct Harness {
    pub db: Database,
    pub storage: WorkflowStorage,
    pub registry: Arc<TriggerRegistry>,
    pub engine: Arc<WorkflowEngine>,
    pub gate: HitlGate,
    pub drip: DripScheduler,
    pub messaging: Arc<RecordingMessaging>,
    pub ai: Arc<ScriptedAi>,
    pub webhooks: Arc<RecordingWebhooks>,
    pub events: Arc<EventLog>,
}

pub async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let storage = WorkflowStorage::new(db.pool().clone());
    let registry = Arc::new(TriggerRegistry::new(storage.clone()));
    let messaging = Arc::new(RecordingMessaging::default());
    let ai = Arc::new(ScriptedAi::default());
    let webhooks = Arc::new(RecordingWebhooks::default());
    let events = Arc::new(EventLog::new(200));

    let executor = TaskExecutor::new(messaging.clone(), ai.clone(), webhooks.clone(), events.clone());
    let engine = Arc::new(WorkflowEngine::new(
        storage.clone(),
        registry.clone(),
        executor,
        events.clone(),
    ));
    let gate = HitlGate::new(engine.clone());
    let drip = DripScheduler::new(DripStorage::new(db.pool().clone()), messaging.clone(), events.clone());

    Harness {
        db,
        storage,
        registry,
        engine,
        gate,
        drip,
        messaging,
        ai,
        webhooks,
        events,
    }
}
