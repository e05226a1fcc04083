/// Core workflow type definitions
///
/// Templates (authored automations), their ordered tasks, and the runtime records
/// created when a trigger fires: instances and per-task executions. All of them are
/// serialized camelCase on the wire.

use crate::db::MAX_DELAY_DAYS;
use crate::error::{AppError, AppResult};
use crate::integrations::messaging::MessageChannel;
use crate::integrations::webhook::WEBHOOK_METHODS;
use crate::workflow::conditions::{Condition, TriggerConfig};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    str::FromStr,
};

/// Longest task delay accepted, in minutes
pub const MAX_DELAY_MINUTES: i64 = MAX_DELAY_DAYS * 24 * 60;

/// Symbolic event names that start workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    LeadCreated,
    LeadStatusChanged,
    DealCreated,
    DealStageChanged,
    MessageReceived,
    MessageWithKeywords,
    WebsiteFormSubmitted,
    WebsiteVisitor,
    WebsiteBookingCreated,
    WebsitePaymentReceived,
    WebsitePaymentAmountThreshold,
    WebsiteCartValueThreshold,
    AppointmentBooked,
    CallCompleted,
    Manual,
}

impl TriggerType {
    pub fn is_message_trigger(&self) -> bool {
        matches!(self, Self::MessageReceived | Self::MessageWithKeywords)
    }

    pub fn is_threshold_trigger(&self) -> bool {
        matches!(
            self,
            Self::WebsitePaymentAmountThreshold | Self::WebsiteCartValueThreshold
        )
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl FromStr for TriggerType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(raw.trim().to_ascii_uppercase()))
            .map_err(|_| AppError::validation(format!("Unknown trigger '{}'", raw)))
    }
}

/// Whether a template runs once per trigger or feeds a drip-style sequence of delayed tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentMode {
    #[default]
    SingleRun,
    Drip,
}

impl EnrollmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleRun => "SINGLE_RUN",
            Self::Drip => "DRIP",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "SINGLE_RUN" => Ok(Self::SingleRun),
            "DRIP" => Ok(Self::Drip),
            other => Err(anyhow::anyhow!("Unknown enrollment mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown instance status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    AwaitingHitl,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::AwaitingHitl => "AWAITING_HITL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "AWAITING_HITL" => Ok(Self::AwaitingHitl),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown execution status: {}", other)),
        }
    }

    /// Statuses that let the next task in order start
    pub fn unblocks_next(&self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }
}

/// What a task does when it runs
///
/// Message bodies and subjects may contain `{{variable}}` placeholders rendered
/// from the instance variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum TaskAction {
    /// Expected variables: `email`
    SendEmail { subject: String, body: String },
    /// Expected variables: `phone`
    SendSms { body: String },
    /// Generate text with the AI collaborator, then deliver it on `channel`
    AiReply {
        prompt: String,
        channel: MessageChannel,
        #[serde(default)]
        subject: Option<String>,
    },
    /// Classify the conversation stored in `transcript_var`
    ScoreConversation {
        #[serde(default = "default_transcript_var")]
        transcript_var: String,
    },
    /// No side effect; the task's delay is the wait
    Wait,
    /// Record a note for the tenant in the engine event log
    NotifyOwner { message: String },
    /// Call an external URL; object payloads get `leadId`, `dealId`, `userId`,
    /// `instanceId` and `timestamp` merged in. A non-2xx answer fails the task.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        payload: Option<Value>,
    },
}

fn default_transcript_var() -> String {
    "transcript".to_string()
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl TaskAction {
    fn validate(&self, task_name: &str) -> AppResult<()> {
        if let Self::Webhook { url, method, .. } = self {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AppError::validation(format!(
                    "Task '{}' needs an http(s) webhook url",
                    task_name
                )));
            }
            if !WEBHOOK_METHODS.contains(&method.to_uppercase().as_str()) {
                return Err(AppError::validation(format!(
                    "Task '{}' uses unsupported webhook method {}",
                    task_name, method
                )));
            }
        }
        Ok(())
    }
}

/// One step of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: String,
    pub template_id: String,
    pub name: String,
    /// Tasks run strictly in ascending display order
    pub display_order: i64,
    /// Human approval gate: the task stops advancement until approved or rejected
    pub is_hitl: bool,
    /// Delay before the task runs, counted from the previous task finishing
    pub delay_minutes: i64,
    pub action: TaskAction,
    /// Conditions over the instance variables; when they do not hold the task is
    /// completed as skipped without running its action or opening its gate
    #[serde(default)]
    pub run_if: Vec<Condition>,
}

impl WorkflowTask {
    pub fn delay(&self) -> AppResult<Duration> {
        Duration::try_minutes(self.delay_minutes)
            .ok_or_else(|| AppError::validation(format!("Task '{}' delay is out of range", self.name)))
    }
}

/// An authored automation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub trigger_types: Vec<TriggerType>,
    pub trigger_config: TriggerConfig,
    pub enrollment_mode: EnrollmentMode,
    pub enabled: bool,
    /// Sorted by `display_order`
    pub tasks: Vec<WorkflowTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn first_task(&self) -> Option<&WorkflowTask> {
        self.tasks.first()
    }

    /// The task that follows `display_order`, if any
    pub fn task_after(&self, display_order: i64) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.display_order > display_order)
    }

    pub fn task(&self, task_id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

/// Task input for template creation and task appends
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub name: String,
    pub display_order: i64,
    #[serde(default)]
    pub is_hitl: bool,
    #[serde(default)]
    pub delay_minutes: i64,
    pub action: TaskAction,
    #[serde(default)]
    pub run_if: Vec<Condition>,
}

impl TaskDraft {
    pub fn into_task(self, template_id: &str) -> WorkflowTask {
        WorkflowTask {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            name: self.name,
            display_order: self.display_order,
            is_hitl: self.is_hitl,
            delay_minutes: self.delay_minutes,
            action: self.action,
            run_if: self.run_if,
        }
    }
}

/// Template input for create and full replace
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_types: Vec<TriggerType>,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    #[serde(default)]
    pub enrollment_mode: EnrollmentMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub tasks: Vec<TaskDraft>,
}

fn default_enabled() -> bool {
    true
}

impl TemplateDraft {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Template name is required"));
        }
        if self.trigger_types.is_empty() {
            return Err(AppError::validation("At least one trigger is required"));
        }
        if self.tasks.is_empty() {
            return Err(AppError::validation("At least one task is required"));
        }
        validate_tasks(&self.tasks, &[])
    }
}

/// Task names must be present, delays within `0..=MAX_DELAY_MINUTES`, actions
/// well-formed and display orders unique (including against `existing` orders
/// when appending).
pub fn validate_tasks(tasks: &[TaskDraft], existing: &[i64]) -> AppResult<()> {
    let mut seen: HashSet<i64> = existing.iter().copied().collect();
    for task in tasks {
        if task.name.trim().is_empty() {
            return Err(AppError::validation("Task name is required"));
        }
        if task.delay_minutes < 0 {
            return Err(AppError::validation(format!(
                "Task '{}' has a negative delay",
                task.name
            )));
        }
        if task.delay_minutes > MAX_DELAY_MINUTES {
            return Err(AppError::validation(format!(
                "Task '{}' delay exceeds {} days",
                task.name, MAX_DELAY_DAYS
            )));
        }
        task.action.validate(&task.name)?;
        if !seen.insert(task.display_order) {
            return Err(AppError::validation(format!(
                "Duplicate displayOrder {}",
                task.display_order
            )));
        }
    }
    Ok(())
}

/// One run of a template against a lead or deal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub template_id: String,
    pub user_id: String,
    pub lead_id: Option<String>,
    pub deal_id: Option<String>,
    pub status: InstanceStatus,
    pub trigger_type: TriggerType,
    /// Trigger variables, used for message rendering
    pub variables: Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One task's run inside an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub instance_id: String,
    pub task_id: String,
    pub user_id: String,
    pub display_order: i64,
    pub status: ExecutionStatus,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payload accompanying a fired trigger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub user_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub deal_id: Option<String>,
    /// Free-form trigger data (message content, channel, amounts, contact details)
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl TriggerContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_lead(mut self, lead_id: impl Into<String>) -> Self {
        self.lead_id = Some(lead_id.into());
        self
    }

    pub fn with_deal(mut self, deal_id: impl Into<String>) -> Self {
        self.deal_id = Some(deal_id.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_names_parse_case_insensitively() {
        assert_eq!("deal_created".parse::<TriggerType>().unwrap(), TriggerType::DealCreated);
        assert_eq!(
            "WEBSITE_FORM_SUBMITTED".parse::<TriggerType>().unwrap(),
            TriggerType::WebsiteFormSubmitted
        );
        assert!("NOT_A_TRIGGER".parse::<TriggerType>().is_err());
        assert_eq!(TriggerType::LeadStatusChanged.to_string(), "LEAD_STATUS_CHANGED");
    }

    #[test]
    fn test_task_action_wire_format() {
        let action: TaskAction = serde_json::from_value(json!({
            "type": "AI_REPLY",
            "prompt": "Follow up with {{name}}",
            "channel": "SMS"
        }))
        .unwrap();
        assert_eq!(
            action,
            TaskAction::AiReply {
                prompt: "Follow up with {{name}}".to_string(),
                channel: MessageChannel::Sms,
                subject: None,
            }
        );

        let score: TaskAction =
            serde_json::from_value(json!({ "type": "SCORE_CONVERSATION" })).unwrap();
        assert_eq!(
            score,
            TaskAction::ScoreConversation { transcript_var: "transcript".to_string() }
        );
    }

    #[test]
    fn test_draft_validation_rejects_duplicate_display_order() {
        let draft: TemplateDraft = serde_json::from_value(json!({
            "name": "Onboarding",
            "triggerTypes": ["DEAL_CREATED"],
            "tasks": [
                { "name": "a", "displayOrder": 1, "action": { "type": "WAIT" } },
                { "name": "b", "displayOrder": 1, "action": { "type": "WAIT" } }
            ]
        }))
        .unwrap();
        assert!(matches!(draft.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_append_validation_checks_existing_orders() {
        let drafts = vec![TaskDraft {
            name: "late".to_string(),
            display_order: 2,
            is_hitl: false,
            delay_minutes: 0,
            action: TaskAction::Wait,
            run_if: Vec::new(),
        }];
        assert!(validate_tasks(&drafts, &[1, 2]).is_err());
        assert!(validate_tasks(&drafts, &[1]).is_ok());
    }

    fn wait_draft(delay_minutes: i64) -> TaskDraft {
        TaskDraft {
            name: "pause".to_string(),
            display_order: 1,
            is_hitl: false,
            delay_minutes,
            action: TaskAction::Wait,
            run_if: Vec::new(),
        }
    }

    #[test]
    fn test_task_delay_is_bounded() {
        assert!(validate_tasks(&[wait_draft(MAX_DELAY_MINUTES)], &[]).is_ok());
        assert!(matches!(
            validate_tasks(&[wait_draft(MAX_DELAY_MINUTES + 1)], &[]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_tasks(&[wait_draft(i64::MAX / 2)], &[]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_unrepresentable_task_delay_is_an_error() {
        let task = wait_draft(i64::MAX / 2).into_task("tpl");
        assert!(matches!(task.delay(), Err(AppError::Validation(_))));
        assert_eq!(wait_draft(90).into_task("tpl").delay().unwrap(), Duration::minutes(90));
    }

    #[test]
    fn test_webhook_action_defaults_and_validation() {
        let action: TaskAction = serde_json::from_value(json!({
            "type": "WEBHOOK",
            "url": "https://hooks.example.com/crm"
        }))
        .unwrap();
        assert_eq!(
            action,
            TaskAction::Webhook {
                url: "https://hooks.example.com/crm".to_string(),
                method: "POST".to_string(),
                headers: BTreeMap::new(),
                payload: None,
            }
        );

        let mut draft = wait_draft(0);
        draft.action = action;
        assert!(validate_tasks(&[draft.clone()], &[]).is_ok());

        draft.action = TaskAction::Webhook {
            url: "ftp://example.com".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            payload: None,
        };
        assert!(validate_tasks(&[draft.clone()], &[]).is_err());

        draft.action = TaskAction::Webhook {
            url: "https://example.com".to_string(),
            method: "TRACE".to_string(),
            headers: BTreeMap::new(),
            payload: None,
        };
        assert!(validate_tasks(&[draft], &[]).is_err());
    }

    #[test]
    fn test_run_if_conditions_deserialize() {
        let draft: TaskDraft = serde_json::from_value(json!({
            "name": "big deals only",
            "displayOrder": 1,
            "action": { "type": "WAIT" },
            "runIf": [{ "field": "amount", "operator": "greater_than", "value": 1000 }]
        }))
        .unwrap();
        assert_eq!(draft.run_if.len(), 1);
    }

    #[test]
    fn test_only_completed_or_approved_unblock_next_task() {
        assert!(ExecutionStatus::Completed.unblocks_next());
        assert!(ExecutionStatus::Approved.unblocks_next());
        assert!(!ExecutionStatus::Rejected.unblocks_next());
        assert!(!ExecutionStatus::AwaitingHitl.unblocks_next());
    }
}
