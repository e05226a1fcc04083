/// Drip sequence types
///
/// A sequence is an ordered list of delayed messages on one channel. Each enrolled
/// contact walks the steps independently; the enrollment remembers which step is
/// next and when it is due.

use crate::db::MAX_DELAY_DAYS;
use crate::error::{AppError, AppResult};
use crate::integrations::MessageChannel;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("Unknown enrollment status: {}", other)),
        }
    }
}

/// One message of a sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DripStep {
    pub step_order: i64,
    /// Delay relative to the previous step, or to enrollment for the first step
    pub delay_days: i64,
    pub delay_hours: i64,
    pub subject: Option<String>,
    pub body: String,
    /// Skip this message when the contact has replied since enrolling
    pub skip_if_engaged: bool,
}

impl DripStep {
    pub fn delay(&self) -> AppResult<Duration> {
        Duration::try_days(self.delay_days)
            .zip(Duration::try_hours(self.delay_hours))
            .and_then(|(days, hours)| days.checked_add(&hours))
            .ok_or_else(|| AppError::validation(format!("Step {} delay is out of range", self.step_order + 1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DripSequence {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub channel: MessageChannel,
    /// Sorted by `step_order`
    pub steps: Vec<DripStep>,
    pub total_sent: i64,
    pub total_delivered: i64,
    pub total_replied: i64,
    pub total_failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub user_id: String,
    pub sequence_id: String,
    pub contact_id: String,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: EnrollmentStatus,
    /// Index into the sequence's steps of the next message to send
    pub current_step: i64,
    pub next_send_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub last_engaged_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// Whether the contact replied at any point since enrolling
    pub fn has_engaged(&self) -> bool {
        self.last_engaged_at
            .map_or(false, |engaged| engaged >= self.enrolled_at)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDraft {
    #[serde(default)]
    pub delay_days: i64,
    #[serde(default)]
    pub delay_hours: i64,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub skip_if_engaged: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceDraft {
    pub name: String,
    pub channel: MessageChannel,
    pub steps: Vec<StepDraft>,
}

impl SequenceDraft {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Sequence name is required"));
        }
        if self.steps.is_empty() {
            return Err(AppError::validation("A sequence needs at least one step"));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.delay_days < 0 || step.delay_hours < 0 {
                return Err(AppError::validation(format!("Step {} has a negative delay", index + 1)));
            }
            let total_hours = step.delay_days.saturating_mul(24).saturating_add(step.delay_hours);
            if total_hours > MAX_DELAY_DAYS * 24 {
                return Err(AppError::validation(format!(
                    "Step {} delay exceeds {} days",
                    index + 1,
                    MAX_DELAY_DAYS
                )));
            }
            if step.body.trim().is_empty() {
                return Err(AppError::validation(format!("Step {} has an empty body", index + 1)));
            }
        }
        Ok(())
    }

    /// Steps numbered in the order given
    pub fn into_steps(self) -> Vec<DripStep> {
        self.steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| DripStep {
                step_order: index as i64,
                delay_days: step.delay_days,
                delay_hours: step.delay_hours,
                subject: step.subject,
                body: step.body,
                skip_if_engaged: step.skip_if_engaged,
            })
            .collect()
    }
}

/// Contact to enroll
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDraft {
    pub contact_id: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl ContactDraft {
    pub fn validate(&self, channel: MessageChannel) -> AppResult<()> {
        if self.contact_id.trim().is_empty() {
            return Err(AppError::validation("contactId is required"));
        }
        let has = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        match channel {
            MessageChannel::Email if !has(&self.email) => {
                Err(AppError::validation("An email address is required for email sequences"))
            }
            MessageChannel::Sms if !has(&self.phone) => {
                Err(AppError::validation("A phone number is required for SMS sequences"))
            }
            _ => Ok(()),
        }
    }
}

/// Summary of one drip tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub completed: usize,
}
