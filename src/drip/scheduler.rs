/// Drip scheduler
///
/// Owns sequence and enrollment operations plus the tick that sends due messages.
/// The tick is driven from outside (cron job or `POST /internal/tick`); each due
/// enrollment is handled on its own so one bad contact never stalls the batch.

use crate::drip::storage::{self, CounterDelta, DripStorage};
use crate::drip::types::{
    ContactDraft, DripSequence, DripStep, Enrollment, EnrollmentStatus, SequenceDraft, TickReport,
};
use crate::db::checked_after;
use crate::error::{AppError, AppResult};
use crate::events::{EngineEvent, EventKind, EventLog};
use crate::integrations::{
    messaging::render_template, EmailMessage, MessageChannel, MessagingProvider, SendOutcome, SmsMessage,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound on enrollments handled by a single tick
const TICK_BATCH: i64 = 500;

enum StepResult {
    Sent,
    Failed(String),
    Skipped,
}

#[derive(Clone)]
pub struct DripScheduler {
    storage: DripStorage,
    messaging: Arc<dyn MessagingProvider>,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for DripScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DripScheduler").field("storage", &self.storage).finish_non_exhaustive()
    }
}

impl DripScheduler {
    pub fn new(storage: DripStorage, messaging: Arc<dyn MessagingProvider>, events: Arc<EventLog>) -> Self {
        Self {
            storage,
            messaging,
            events,
        }
    }

    pub fn storage(&self) -> &DripStorage {
        &self.storage
    }

    pub async fn create_sequence(&self, user_id: &str, draft: SequenceDraft) -> AppResult<DripSequence> {
        draft.validate()?;
        let now = Utc::now();
        let sequence = DripSequence {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: draft.name.trim().to_string(),
            channel: draft.channel,
            steps: draft.into_steps(),
            total_sent: 0,
            total_delivered: 0,
            total_replied: 0,
            total_failed: 0,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_sequence(&sequence).await?;

        tracing::info!(
            "💧 Created drip sequence {} ({} steps) for user {}",
            sequence.id,
            sequence.steps.len(),
            user_id
        );
        Ok(sequence)
    }

    pub async fn list_sequences(&self, user_id: &str) -> AppResult<Vec<DripSequence>> {
        Ok(self.storage.list_sequences(user_id).await?)
    }

    pub async fn get_sequence(&self, user_id: &str, sequence_id: &str) -> AppResult<DripSequence> {
        self.storage
            .get_sequence(user_id, sequence_id)
            .await?
            .ok_or_else(|| AppError::not_found("Sequence"))
    }

    pub async fn list_enrollments(&self, user_id: &str, sequence_id: &str) -> AppResult<Vec<Enrollment>> {
        self.get_sequence(user_id, sequence_id).await?;
        Ok(self.storage.list_enrollments(user_id, sequence_id).await?)
    }

    /// Enroll a contact; the first message is due after the first step's delay
    pub async fn enroll(&self, user_id: &str, sequence_id: &str, contact: ContactDraft) -> AppResult<Enrollment> {
        let sequence = self.get_sequence(user_id, sequence_id).await?;
        let first = sequence
            .steps
            .first()
            .ok_or_else(|| AppError::validation("Sequence has no steps"))?;
        contact.validate(sequence.channel)?;

        let now = Utc::now();
        let first_send_at = checked_after(now, first.delay()?)?;
        let enrollment = Enrollment {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            sequence_id: sequence.id.clone(),
            contact_id: contact.contact_id,
            contact_name: contact.contact_name,
            email: contact.email,
            phone: contact.phone,
            status: EnrollmentStatus::Active,
            current_step: 0,
            next_send_at: Some(first_send_at),
            enrolled_at: now,
            last_engaged_at: None,
            updated_at: now,
        };
        self.storage.insert_enrollment(&enrollment).await?;

        tracing::info!(
            "📋 Enrolled contact {} in sequence {} (first send at {:?})",
            enrollment.contact_id,
            sequence.id,
            enrollment.next_send_at
        );
        Ok(enrollment)
    }

    pub async fn record_reply(&self, user_id: &str, enrollment_id: &str) -> AppResult<Enrollment> {
        if !self.storage.record_reply(user_id, enrollment_id, Utc::now()).await? {
            return Err(AppError::not_found("Enrollment"));
        }
        tracing::debug!("💬 Reply recorded for enrollment {}", enrollment_id);
        self.enrollment(user_id, enrollment_id).await
    }

    pub async fn cancel(&self, user_id: &str, enrollment_id: &str) -> AppResult<Enrollment> {
        let current = self.enrollment(user_id, enrollment_id).await?;
        if current.status != EnrollmentStatus::Active {
            return Err(AppError::validation(format!(
                "Enrollment is {} and cannot be cancelled",
                current.status.as_str()
            )));
        }
        if !self.storage.cancel_enrollment(user_id, enrollment_id, Utc::now()).await? {
            return Err(AppError::conflict("Enrollment changed while cancelling"));
        }
        tracing::info!("🛑 Cancelled enrollment {}", enrollment_id);
        self.enrollment(user_id, enrollment_id).await
    }

    async fn enrollment(&self, user_id: &str, enrollment_id: &str) -> AppResult<Enrollment> {
        self.storage
            .get_enrollment(user_id, enrollment_id)
            .await?
            .ok_or_else(|| AppError::not_found("Enrollment"))
    }

    /// Send every message due at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> AppResult<TickReport> {
        let due = self.storage.due_enrollments(now, TICK_BATCH).await?;
        let mut report = TickReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        tracing::debug!("⏱️ Drip tick: {} enrollments due", due.len());

        let mut sequences: HashMap<String, Option<DripSequence>> = HashMap::new();
        for enrollment in due {
            if !sequences.contains_key(&enrollment.sequence_id) {
                let loaded = self.storage.load_sequence(&enrollment.sequence_id).await?;
                sequences.insert(enrollment.sequence_id.clone(), loaded);
            }
            let Some(Some(sequence)) = sequences.get(&enrollment.sequence_id) else {
                tracing::warn!(
                    "⚠️ Enrollment {} points at missing sequence {}",
                    enrollment.id,
                    enrollment.sequence_id
                );
                continue;
            };

            report.processed += 1;
            match self.process(sequence, &enrollment, now).await {
                Ok(Some((result, completed))) => {
                    match result {
                        StepResult::Sent => report.sent += 1,
                        StepResult::Failed(_) => report.failed += 1,
                        StepResult::Skipped => report.skipped += 1,
                    }
                    if completed {
                        report.completed += 1;
                    }
                }
                Ok(None) => {
                    tracing::debug!("🔁 Enrollment {} already advanced elsewhere", enrollment.id);
                }
                Err(e) => {
                    tracing::error!("❌ Drip step for enrollment {} failed: {}", enrollment.id, e);
                }
            }
        }

        if report.processed > 0 {
            tracing::info!(
                "💧 Drip tick: processed {}, sent {}, skipped {}, failed {}, completed {}",
                report.processed,
                report.sent,
                report.skipped,
                report.failed,
                report.completed
            );
        }
        Ok(report)
    }

    /// One enrollment step. `None` when another tick moved the enrollment first.
    async fn process(
        &self,
        sequence: &DripSequence,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<(StepResult, bool)>> {
        let index = enrollment.current_step.max(0) as usize;
        let next_index = index + 1;
        let (status, next_send_at) = match sequence.steps.get(next_index) {
            Some(next) => {
                let candidate = checked_after(now, next.delay()?)?;
                let floor = enrollment.next_send_at.unwrap_or(candidate);
                (EnrollmentStatus::Active, Some(candidate.max(floor)))
            }
            None => (EnrollmentStatus::Completed, None),
        };

        let result = match sequence.steps.get(index) {
            Some(step) if step.skip_if_engaged && enrollment.has_engaged() => StepResult::Skipped,
            Some(step) => match self.send(sequence, step, enrollment).await {
                outcome if outcome.success => StepResult::Sent,
                outcome => StepResult::Failed(outcome.error.unwrap_or_else(|| "send failed".to_string())),
            },
            // Nothing left to send: fall through to completion
            None => StepResult::Skipped,
        };

        let delta = match &result {
            StepResult::Sent => CounterDelta { sent: 1, delivered: 1, failed: 0 },
            StepResult::Failed(_) => CounterDelta { sent: 1, delivered: 0, failed: 1 },
            StepResult::Skipped => CounterDelta::default(),
        };

        let mut tx = self.storage.pool().begin().await?;
        let moved = storage::advance_enrollment(
            &mut *tx,
            &enrollment.id,
            enrollment.current_step,
            next_index as i64,
            status,
            next_send_at,
            now,
        )
        .await?;
        if !moved {
            return Ok(None);
        }
        storage::bump_counters(&mut *tx, &sequence.id, delta, now).await?;
        tx.commit().await?;

        match &result {
            StepResult::Sent => self.events.record(
                EngineEvent::new(
                    EventKind::DripSent,
                    format!("Step {} of {} sent to {}", index + 1, sequence.name, enrollment.contact_id),
                )
                .for_user(&enrollment.user_id),
            ),
            StepResult::Failed(error) => {
                tracing::warn!("⚠️ Drip send for enrollment {} failed: {}", enrollment.id, error);
                self.events.record(
                    EngineEvent::new(
                        EventKind::DripFailed,
                        format!("Step {} of {} failed: {}", index + 1, sequence.name, error),
                    )
                    .for_user(&enrollment.user_id),
                );
            }
            StepResult::Skipped => {
                tracing::debug!("⏭️ Skipped step {} for engaged enrollment {}", index + 1, enrollment.id);
            }
        }

        let completed = status == EnrollmentStatus::Completed;
        if completed {
            self.events.record(
                EngineEvent::new(
                    EventKind::DripCompleted,
                    format!("{} finished for {}", sequence.name, enrollment.contact_id),
                )
                .for_user(&enrollment.user_id),
            );
        }
        Ok(Some((result, completed)))
    }

    async fn send(&self, sequence: &DripSequence, step: &DripStep, enrollment: &Enrollment) -> SendOutcome {
        let variables = contact_variables(enrollment);
        let body = render_template(&step.body, &variables);

        match sequence.channel {
            MessageChannel::Email => {
                let Some(to) = enrollment.email.clone() else {
                    return SendOutcome::failed("Contact has no email address");
                };
                let subject = step.subject.as_deref().unwrap_or(&sequence.name);
                self.messaging
                    .send_email(&EmailMessage {
                        user_id: enrollment.user_id.clone(),
                        to,
                        to_name: enrollment.contact_name.clone(),
                        subject: render_template(subject, &variables),
                        body,
                    })
                    .await
            }
            MessageChannel::Sms => {
                let Some(to) = enrollment.phone.clone() else {
                    return SendOutcome::failed("Contact has no phone number");
                };
                self.messaging
                    .send_sms(&SmsMessage {
                        user_id: enrollment.user_id.clone(),
                        to,
                        body,
                    })
                    .await
            }
        }
    }
}

fn contact_variables(enrollment: &Enrollment) -> Map<String, Value> {
    let mut variables = Map::new();
    let fields = [
        ("name", &enrollment.contact_name),
        ("email", &enrollment.email),
        ("phone", &enrollment.phone),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            variables.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    variables
}
