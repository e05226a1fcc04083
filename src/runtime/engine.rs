/// Execution advancer
///
/// Starts instances for fired triggers and drives them forward one task at a time
/// in ascending display order. Every transition that must be observed together
/// (finish a task + create the next execution, or fail a task + fail the instance)
/// commits in one transaction; task actions themselves run outside any transaction.

use crate::db::checked_after;
use crate::error::{AppError, AppResult};
use crate::events::{EngineEvent, EventKind, EventLog};
use crate::runtime::executor::TaskExecutor;
use crate::workflow::{
    conditions::conditions_hold,
    storage::{self, WorkflowStorage},
    types::{
        ExecutionStatus, InstanceStatus, TaskExecution, TriggerContext, TriggerType,
        WorkflowInstance, WorkflowTask, WorkflowTemplate,
    },
    TriggerRegistry,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;

/// Upper bound on delayed executions picked up by one `process_due` pass
const DUE_BATCH: i64 = 500;

/// Where an instance stands after an `advance` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum AdvanceOutcome {
    AwaitingApproval { execution_id: String },
    Scheduled { execution_id: String, at: DateTime<Utc> },
    Completed,
    Failed { error: String },
    /// Nothing to do: the execution was not pending, or its instance is not running
    Skipped,
}

/// Result of scheduling whatever follows a finished task
#[derive(Debug)]
pub(crate) enum NextStep {
    Scheduled(TaskExecution),
    Completed,
    /// Last task done but the instance is not RUNNING; completion waits for a resume
    Held,
}

enum Step {
    Continue { execution_id: String, now: DateTime<Utc> },
    Done(AdvanceOutcome),
}

/// Instances started and templates skipped by one dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub started: Vec<String>,
    /// Template ids skipped because an active instance already targets the same lead/deal
    pub deduplicated: Vec<String>,
    /// Template ids whose instance could not be started
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub struct WorkflowEngine {
    storage: WorkflowStorage,
    registry: Arc<TriggerRegistry>,
    executor: TaskExecutor,
    events: Arc<EventLog>,
}

impl WorkflowEngine {
    pub fn new(
        storage: WorkflowStorage,
        registry: Arc<TriggerRegistry>,
        executor: TaskExecutor,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            storage,
            registry,
            executor,
            events,
        }
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Start one instance per matching enabled template of the tenant.
    /// Zero matches is a no-op.
    pub async fn dispatch(&self, trigger: TriggerType, ctx: TriggerContext) -> AppResult<DispatchReport> {
        let templates = self.registry.matching(&ctx.user_id, trigger, &ctx.variables);
        let mut report = DispatchReport::default();

        if templates.is_empty() {
            tracing::debug!("🔕 No templates for {} (user {})", trigger, ctx.user_id);
            return Ok(report);
        }

        tracing::info!("⚡ Trigger {} matched {} templates for user {}", trigger, templates.len(), ctx.user_id);

        for template in templates {
            match self.start_instance(&template, trigger, &ctx).await {
                Ok(Some((instance, execution))) => {
                    report.started.push(instance.id.clone());
                    if execution.scheduled_for <= Utc::now() {
                        if let Err(e) = self.advance(&instance.user_id, &execution.id).await {
                            tracing::error!("❌ Initial advance of instance {} failed: {}", instance.id, e);
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!(
                        "⏭️ Template {} already active for lead={:?} deal={:?}, skipping",
                        template.id,
                        ctx.lead_id,
                        ctx.deal_id
                    );
                    report.deduplicated.push(template.id.clone());
                }
                Err(e) => {
                    tracing::error!("❌ Could not start template {}: {}", template.id, e);
                    self.events.record(
                        EngineEvent::new(EventKind::TriggerFailed, format!("{}: {}", template.id, e))
                            .for_user(&ctx.user_id),
                    );
                    report.failed.push(template.id.clone());
                }
            }
        }

        Ok(report)
    }

    /// Create a RUNNING instance and a PENDING execution for the template's first task
    /// in one transaction. Does not advance. `None` when an active instance of the
    /// template already targets the same lead or deal.
    pub async fn start_instance(
        &self,
        template: &WorkflowTemplate,
        trigger: TriggerType,
        ctx: &TriggerContext,
    ) -> AppResult<Option<(WorkflowInstance, TaskExecution)>> {
        let first = template
            .first_task()
            .ok_or_else(|| AppError::validation("Template has no tasks"))?;

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: template.id.clone(),
            user_id: ctx.user_id.clone(),
            lead_id: ctx.lead_id.clone(),
            deal_id: ctx.deal_id.clone(),
            status: InstanceStatus::Running,
            trigger_type: trigger,
            variables: Value::Object(ctx.variables.clone()),
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        let execution = pending_execution(&instance, first, now)?;

        let mut tx = self.storage.pool().begin().await?;
        if !storage::insert_instance_if_new(&mut *tx, &instance).await? {
            return Ok(None);
        }
        storage::insert_execution(&mut *tx, &execution).await?;
        tx.commit().await?;

        tracing::info!("🟢 Started instance {} of template {} ({})", instance.id, template.id, trigger);
        self.events.record(
            EngineEvent::new(EventKind::InstanceStarted, format!("{} via {}", template.name, trigger))
                .for_user(&instance.user_id)
                .instance(&instance.id),
        );

        Ok(Some((instance, execution)))
    }

    /// Process `execution_id` of `user_id` and keep going while the next execution is due now
    pub async fn advance(&self, user_id: &str, execution_id: &str) -> AppResult<AdvanceOutcome> {
        self.advance_at(user_id, execution_id, Utc::now()).await
    }

    /// `advance` with an explicit clock; executions scheduled after `now` are left alone
    pub async fn advance_at(
        &self,
        user_id: &str,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<AdvanceOutcome> {
        let mut current = execution_id.to_string();
        let mut now = now;
        loop {
            match self.step(user_id, &current, now).await? {
                Step::Continue { execution_id, now: next_now } => {
                    current = execution_id;
                    now = next_now;
                }
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    async fn step(&self, user_id: &str, execution_id: &str, now: DateTime<Utc>) -> AppResult<Step> {
        let execution = self
            .storage
            .get_execution_for_user(user_id, execution_id)
            .await?
            .ok_or_else(|| AppError::not_found("Execution"))?;

        if execution.status != ExecutionStatus::Pending {
            tracing::debug!("⏭️ Execution {} is {}, nothing to do", execution.id, execution.status.as_str());
            return Ok(Step::Done(AdvanceOutcome::Skipped));
        }

        if execution.scheduled_for > now {
            return Ok(Step::Done(AdvanceOutcome::Scheduled {
                execution_id: execution.id,
                at: execution.scheduled_for,
            }));
        }

        // Conditional claim: a concurrent or repeated call loses here and does nothing
        if !self.storage.claim_execution(user_id, &execution.id, now).await? {
            tracing::debug!("⏭️ Execution {} not claimable (instance not running or already claimed)", execution.id);
            return Ok(Step::Done(AdvanceOutcome::Skipped));
        }

        // The execution is RUNNING from here on; any error must land it in FAILED
        match self.run_claimed(&execution, now).await {
            Ok(step) => Ok(step),
            Err(e) => {
                tracing::error!("❌ Advancing claimed execution {} failed: {}", execution.id, e);
                let outcome = self.fail(&execution, &e.to_string(), now.max(Utc::now())).await?;
                Ok(Step::Done(outcome))
            }
        }
    }

    async fn run_claimed(&self, execution: &TaskExecution, now: DateTime<Utc>) -> AppResult<Step> {
        let instance = self
            .storage
            .get_instance_for_user(&execution.user_id, &execution.instance_id)
            .await?
            .ok_or_else(|| AppError::not_found("Instance"))?;

        let Some(template) = self.storage.get_template(&instance.user_id, &instance.template_id).await? else {
            let outcome = self.fail(execution, "Template no longer exists", now).await?;
            return Ok(Step::Done(outcome));
        };

        let Some(task) = template.task(&execution.task_id).cloned() else {
            let outcome = self.fail(execution, "Task no longer exists", now).await?;
            return Ok(Step::Done(outcome));
        };

        let variables = instance.variables.as_object().cloned().unwrap_or_default();
        if !conditions_hold(&task.run_if, &variables) {
            tracing::info!("⏭️ Task {} of instance {} skipped, conditions not met", task.name, instance.id);
            let result = json!({ "skipped": true, "reason": "conditions not met" });
            return self.complete(execution, &template, &instance, &task, &result, now).await;
        }

        if task.is_hitl {
            let mut conn = self.storage.pool().acquire().await?;
            storage::open_gate(&mut conn, &execution.id).await?;
            drop(conn);

            tracing::info!("✋ Execution {} ({}) awaiting approval", execution.id, task.name);
            self.events.record(
                EngineEvent::new(EventKind::HitlRequested, format!("Approval needed: {}", task.name))
                    .for_user(&instance.user_id)
                    .instance(&instance.id)
                    .execution(&execution.id),
            );
            return Ok(Step::Done(AdvanceOutcome::AwaitingApproval {
                execution_id: execution.id.clone(),
            }));
        }

        let outcome = self.executor.execute_task(&task, &instance).await;
        let finished_at = now.max(Utc::now());
        match outcome {
            Ok(result) => self.complete(execution, &template, &instance, &task, &result, finished_at).await,
            Err(e) => {
                let outcome = self.fail(execution, &format!("{:#}", e), finished_at).await?;
                Ok(Step::Done(outcome))
            }
        }
    }

    /// Finish a RUNNING execution and schedule what follows, in one transaction
    async fn complete(
        &self,
        execution: &TaskExecution,
        template: &WorkflowTemplate,
        instance: &WorkflowInstance,
        task: &WorkflowTask,
        result: &Value,
        finished_at: DateTime<Utc>,
    ) -> AppResult<Step> {
        let mut tx = self.storage.pool().begin().await?;
        storage::finish_execution(
            &mut tx,
            &execution.id,
            ExecutionStatus::Completed,
            Some(result),
            None,
            finished_at,
        )
        .await?;
        let next = schedule_next(&mut *tx, template, instance, task.display_order, finished_at).await?;
        tx.commit().await?;

        self.events.record(
            EngineEvent::new(EventKind::TaskCompleted, task.name.clone())
                .for_user(&instance.user_id)
                .instance(&instance.id)
                .execution(&execution.id),
        );

        Ok(self.after_transition(instance, next, finished_at))
    }

    /// Turn the scheduling result of a finished task into the next loop step
    fn after_transition(&self, instance: &WorkflowInstance, next: NextStep, now: DateTime<Utc>) -> Step {
        match next {
            NextStep::Scheduled(execution) if execution.scheduled_for <= now => Step::Continue {
                execution_id: execution.id,
                now,
            },
            NextStep::Scheduled(execution) => {
                tracing::info!("⏰ Next task of instance {} scheduled for {}", instance.id, execution.scheduled_for);
                Step::Done(AdvanceOutcome::Scheduled {
                    execution_id: execution.id,
                    at: execution.scheduled_for,
                })
            }
            NextStep::Completed => {
                self.record_completed(instance);
                Step::Done(AdvanceOutcome::Completed)
            }
            NextStep::Held => Step::Done(AdvanceOutcome::Skipped),
        }
    }

    pub(crate) fn record_completed(&self, instance: &WorkflowInstance) {
        tracing::info!("🏁 Instance {} completed", instance.id);
        self.events.record(
            EngineEvent::new(EventKind::InstanceCompleted, "All tasks finished")
                .for_user(&instance.user_id)
                .instance(&instance.id),
        );
    }

    /// Mark the execution and its instance FAILED together. No automatic retry.
    async fn fail(&self, execution: &TaskExecution, error: &str, now: DateTime<Utc>) -> AppResult<AdvanceOutcome> {
        let mut tx = self.storage.pool().begin().await?;
        storage::finish_execution(&mut *tx, &execution.id, ExecutionStatus::Failed, None, Some(error), now).await?;
        storage::transition_instance(
            &mut tx,
            &execution.instance_id,
            &[InstanceStatus::Running, InstanceStatus::Paused],
            InstanceStatus::Failed,
            now,
        )
        .await?;
        tx.commit().await?;

        tracing::error!("💥 Instance {} failed at execution {}: {}", execution.instance_id, execution.id, error);
        self.events.record(
            EngineEvent::new(EventKind::InstanceFailed, error.to_string())
                .for_user(&execution.user_id)
                .instance(&execution.instance_id)
                .execution(&execution.id),
        );

        Ok(AdvanceOutcome::Failed {
            error: error.to_string(),
        })
    }

    /// Advance every PENDING execution of a RUNNING instance that is due at `now`.
    /// Returns how many executions were picked up.
    pub async fn process_due(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let due = self.storage.due_executions(now, DUE_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }

        tracing::info!("⏰ Processing {} due task executions", due.len());
        for item in &due {
            if let Err(e) = self.advance_at(&item.user_id, &item.execution_id, now).await {
                tracing::error!("❌ Advancing due execution {} failed: {}", item.execution_id, e);
            }
        }
        Ok(due.len())
    }

    /// Operator pause: RUNNING -> PAUSED. In-flight work is not interrupted.
    pub async fn pause_instance(&self, user_id: &str, instance_id: &str) -> AppResult<WorkflowInstance> {
        let instance = self
            .storage
            .get_instance_for_user(user_id, instance_id)
            .await?
            .ok_or_else(|| AppError::not_found("Instance"))?;

        let mut conn = self.storage.pool().acquire().await?;
        let paused = storage::transition_instance(
            &mut conn,
            &instance.id,
            &[InstanceStatus::Running],
            InstanceStatus::Paused,
            Utc::now(),
        )
        .await?;
        drop(conn);

        if !paused {
            return Err(AppError::validation(format!(
                "Instance is {} and cannot be paused",
                instance.status.as_str()
            )));
        }

        tracing::info!("⏸️ Instance {} paused by operator", instance.id);
        self.events.record(
            EngineEvent::new(EventKind::InstancePaused, "Paused by operator")
                .for_user(user_id)
                .instance(&instance.id),
        );

        self.load_instance(user_id, instance_id).await
    }

    /// Operator resume. Re-runs a REJECTED/FAILED tail task only when `reset_failed` is set.
    pub async fn resume_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        reset_failed: bool,
    ) -> AppResult<WorkflowInstance> {
        let instance = self
            .storage
            .get_instance_for_user(user_id, instance_id)
            .await?
            .ok_or_else(|| AppError::not_found("Instance"))?;
        let template = self
            .storage
            .get_template(user_id, &instance.template_id)
            .await?
            .ok_or_else(|| AppError::not_found("Template"))?;
        let tail = self.storage.latest_execution(&instance.id).await?;

        let tail_is_dead_end = tail
            .as_ref()
            .map_or(false, |t| matches!(t.status, ExecutionStatus::Rejected | ExecutionStatus::Failed));

        match instance.status {
            InstanceStatus::Completed => {
                return Err(AppError::validation("Completed instances cannot be resumed"));
            }
            InstanceStatus::Running if !tail_is_dead_end => {
                return Err(AppError::validation("Instance is already running"));
            }
            _ => {}
        }
        if tail_is_dead_end && !reset_failed {
            return Err(AppError::validation(
                "Last task was rejected or failed; resume with resetFailed to run it again",
            ));
        }

        let now = Utc::now();
        let mut tx = self.storage.pool().begin().await?;
        storage::transition_instance(
            &mut tx,
            &instance.id,
            &[InstanceStatus::Paused, InstanceStatus::Failed],
            InstanceStatus::Running,
            now,
        )
        .await?;

        let mut completed = false;
        if let Some(tail) = &tail {
            match tail.status {
                ExecutionStatus::Rejected | ExecutionStatus::Failed => {
                    let task = template
                        .task(&tail.task_id)
                        .ok_or_else(|| AppError::conflict("Task of the last execution no longer exists"))?;
                    let retry = pending_execution(&instance, task, now)?;
                    storage::insert_execution(&mut *tx, &retry).await?;
                    tracing::info!("🔁 Re-running task {} of instance {}", task.name, instance.id);
                }
                ExecutionStatus::Completed | ExecutionStatus::Approved => {
                    let next = schedule_next(&mut *tx, &template, &instance, tail.display_order, now).await?;
                    completed = matches!(next, NextStep::Completed);
                }
                _ => {}
            }
        }
        tx.commit().await?;

        tracing::info!("▶️ Instance {} resumed", instance.id);
        self.events.record(
            EngineEvent::new(EventKind::InstanceResumed, format!("Resumed (reset: {})", reset_failed))
                .for_user(user_id)
                .instance(&instance.id),
        );

        if completed {
            self.record_completed(&instance);
        } else {
            let due = self
                .storage
                .due_executions_for_instance(user_id, &instance.id, Utc::now())
                .await?;
            for execution_id in due {
                if let Err(e) = self.advance(user_id, &execution_id).await {
                    tracing::error!("❌ Advancing resumed execution {} failed: {}", execution_id, e);
                }
            }
        }

        self.load_instance(user_id, instance_id).await
    }

    async fn load_instance(&self, user_id: &str, instance_id: &str) -> AppResult<WorkflowInstance> {
        self.storage
            .get_instance_for_user(user_id, instance_id)
            .await?
            .ok_or_else(|| AppError::not_found("Instance"))
    }
}

/// A fresh PENDING execution of `task`, due after the task's delay
pub(crate) fn pending_execution(
    instance: &WorkflowInstance,
    task: &WorkflowTask,
    from: DateTime<Utc>,
) -> AppResult<TaskExecution> {
    Ok(TaskExecution {
        id: uuid::Uuid::new_v4().to_string(),
        instance_id: instance.id.clone(),
        task_id: task.id.clone(),
        user_id: instance.user_id.clone(),
        display_order: task.display_order,
        status: ExecutionStatus::Pending,
        scheduled_for: checked_after(from, task.delay()?)?,
        started_at: None,
        finished_at: None,
        notes: None,
        result: None,
        error: None,
        decided_by: None,
        created_at: from,
    })
}

/// Insert the execution of the task after `after_order`, or complete the instance
/// when there is none. Runs on the caller's transaction.
pub(crate) async fn schedule_next(
    conn: &mut SqliteConnection,
    template: &WorkflowTemplate,
    instance: &WorkflowInstance,
    after_order: i64,
    now: DateTime<Utc>,
) -> Result<NextStep> {
    match template.task_after(after_order) {
        Some(task) => {
            let execution = pending_execution(instance, task, now)?;
            storage::insert_execution(conn, &execution).await?;
            Ok(NextStep::Scheduled(execution))
        }
        None => {
            let completed = storage::transition_instance(
                conn,
                &instance.id,
                &[InstanceStatus::Running],
                InstanceStatus::Completed,
                now,
            )
            .await?;
            Ok(if completed { NextStep::Completed } else { NextStep::Held })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, template_fixture, Harness};
    use crate::workflow::conditions::{Condition, ConditionLogic, ConditionOperator};
    use crate::workflow::types::TaskAction;
    use chrono::Duration;

    async fn install(h: &Harness, template: &WorkflowTemplate) {
        h.storage.insert_template(template).await.unwrap();
        h.registry.reload_template(&template.user_id, &template.id).await.unwrap();
    }

    fn deal_ctx(user: &str, deal: &str) -> TriggerContext {
        TriggerContext::new(user)
            .with_deal(deal)
            .with_variable("email", "buyer@example.com")
            .with_variable("name", "Dana")
    }

    #[tokio::test]
    async fn test_trigger_creates_running_instance_and_pending_first_execution() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, false)]);
        template.tasks[0].delay_minutes = 30;
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        assert_eq!(report.started.len(), 1);

        let instance = h.storage.get_instance_for_user("u1", &report.started[0]).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        let executions = h.storage.list_executions(&instance.id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Pending);
        assert_eq!(executions[0].task_id, template.tasks[0].id);
    }

    #[tokio::test]
    async fn test_no_matching_template_is_a_noop() {
        let h = harness().await;
        let report = h.engine.dispatch(TriggerType::LeadCreated, TriggerContext::new("u1")).await.unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_each_matching_template_gets_its_own_instance() {
        let h = harness().await;
        let a = template_fixture("u1", &[(1, true)]);
        let b = template_fixture("u1", &[(1, true)]);
        install(&h, &a).await;
        install(&h, &b).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        assert_eq!(report.started.len(), 2);
    }

    #[tokio::test]
    async fn test_active_instance_for_same_entity_is_deduplicated() {
        let h = harness().await;
        let template = template_fixture("u1", &[(1, true)]);
        install(&h, &template).await;

        let first = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let again = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let other = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-2")).await.unwrap();

        assert_eq!(first.started.len(), 1);
        assert!(again.started.is_empty());
        assert_eq!(again.deduplicated, vec![template.id.clone()]);
        assert_eq!(other.started.len(), 1);
    }

    #[tokio::test]
    async fn test_non_hitl_then_hitl_stops_at_gate() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, true)]);
        template.tasks[0].action = TaskAction::SendEmail {
            subject: "Welcome {{name}}".into(),
            body: "Thanks".into(),
        };
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let executions = h.storage.list_executions(&report.started[0]).await.unwrap();

        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
        assert_eq!(executions[1].status, ExecutionStatus::AwaitingHitl);
        assert_eq!(h.messaging.emails()[0].subject, "Welcome Dana");

        let instance = h.storage.get_instance_for_user("u1", &report.started[0]).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(h.events.recent_of_kind(EventKind::HitlRequested, 5).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_action_fails_instance_and_halts() {
        let h = harness().await;
        h.messaging.fail_with("provider down");
        let mut template = template_fixture("u1", &[(1, false), (2, false)]);
        template.tasks[0].action = TaskAction::SendEmail { subject: "s".into(), body: "b".into() };
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let instance = h.storage.get_instance_for_user("u1", &report.started[0]).await.unwrap().unwrap();
        let executions = h.storage.list_executions(&instance.id).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].error.as_deref().unwrap_or("").contains("provider down"));
    }

    #[tokio::test]
    async fn test_advance_is_idempotent_for_finished_executions() {
        let h = harness().await;
        let template = template_fixture("u1", &[(1, false)]);
        install(&h, &template).await;

        let ctx = deal_ctx("u1", "deal-1");
        let (instance, execution) = h
            .engine
            .start_instance(&template, TriggerType::DealCreated, &ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.engine.advance("u1", &execution.id).await.unwrap(), AdvanceOutcome::Completed);
        assert_eq!(h.engine.advance("u1", &execution.id).await.unwrap(), AdvanceOutcome::Skipped);
        assert_eq!(h.storage.list_executions(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_task_runs_on_process_due() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, false)]);
        template.tasks[1].delay_minutes = 60;
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let instance_id = report.started[0].clone();

        assert_eq!(h.engine.process_due(Utc::now()).await.unwrap(), 0);
        let executions = h.storage.list_executions(&instance_id).await.unwrap();
        assert_eq!(executions[1].status, ExecutionStatus::Pending);
        assert!(executions[1].scheduled_for >= executions[0].finished_at.unwrap() + Duration::minutes(60));

        let picked = h.engine.process_due(Utc::now() + Duration::minutes(61)).await.unwrap();
        assert_eq!(picked, 1);

        let executions = h.storage.list_executions(&instance_id).await.unwrap();
        assert_eq!(executions[1].status, ExecutionStatus::Completed);
        let instance = h.storage.get_instance_for_user("u1", &instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_executions_follow_display_order() {
        let h = harness().await;
        let template = template_fixture("u1", &[(30, false), (10, false), (20, false)]);
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let orders: Vec<i64> = h
            .storage
            .list_executions(&report.started[0])
            .await
            .unwrap()
            .iter()
            .map(|e| e.display_order)
            .collect();
        assert_eq!(orders, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_pause_blocks_advancement_and_resume_continues() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, false)]);
        template.tasks[0].delay_minutes = 1;
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let instance_id = report.started[0].clone();
        let paused = h.engine.pause_instance("u1", &instance_id).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);

        // Other tenants cannot touch it
        assert!(matches!(
            h.engine.pause_instance("u2", &instance_id).await,
            Err(AppError::NotFound(_))
        ));

        let later = Utc::now() + Duration::minutes(2);
        let first = h.storage.list_executions(&instance_id).await.unwrap().remove(0);
        assert_eq!(h.engine.advance_at("u1", &first.id, later).await.unwrap(), AdvanceOutcome::Skipped);
        assert_eq!(h.engine.process_due(later).await.unwrap(), 0);

        let resumed = h.engine.resume_instance("u1", &instance_id, false).await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Running);

        assert_eq!(h.engine.process_due(later).await.unwrap(), 1);
        let instance = h.storage.get_instance_for_user("u1", &instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_with_reset_reruns_failed_task() {
        let h = harness().await;
        h.messaging.fail_with("bounced");
        let mut template = template_fixture("u1", &[(1, false)]);
        template.tasks[0].action = TaskAction::SendEmail { subject: "s".into(), body: "b".into() };
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let instance_id = report.started[0].clone();

        assert!(matches!(
            h.engine.resume_instance("u1", &instance_id, false).await,
            Err(AppError::Validation(_))
        ));

        h.messaging.recover();
        let resumed = h.engine.resume_instance("u1", &instance_id, true).await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Completed);

        let statuses: Vec<ExecutionStatus> = h
            .storage
            .list_executions(&instance_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec![ExecutionStatus::Failed, ExecutionStatus::Completed]);
        assert_eq!(h.messaging.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_instance_variables_come_from_trigger() {
        let h = harness().await;
        let template = template_fixture("u1", &[(1, true)]);
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-9")).await.unwrap();
        let instance = h.storage.get_instance_for_user("u1", &report.started[0]).await.unwrap().unwrap();
        assert_eq!(instance.deal_id.as_deref(), Some("deal-9"));
        assert_eq!(instance.variables, json!({ "email": "buyer@example.com", "name": "Dana" }));
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_for_same_deal_starts_one_instance() {
        let h = harness().await;
        let template = template_fixture("u1", &[(1, true)]);
        install(&h, &template).await;

        let (a, b) = tokio::join!(
            h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")),
            h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.started.len() + b.started.len(), 1);
        assert_eq!(a.deduplicated.len() + b.deduplicated.len(), 1);
        assert_eq!(h.storage.count_instances(&template.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_first_delay_fails_the_trigger_without_panicking() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false)]);
        template.tasks[0].delay_minutes = i64::MAX / 2;
        // Stored directly: drafts with such a delay are refused at validation
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(report.failed, vec![template.id.clone()]);
        assert_eq!(h.storage.count_instances(&template.id).await.unwrap(), 0);
        assert_eq!(h.events.recent_of_kind(EventKind::TriggerFailed, 5).len(), 1);
    }

    #[tokio::test]
    async fn test_error_after_claim_fails_execution_instead_of_leaving_it_running() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, false)]);
        template.tasks[1].delay_minutes = i64::MAX / 2;
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let instance_id = report.started[0].clone();

        let executions = h.storage.list_executions(&instance_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].error.as_deref().unwrap_or("").contains("out of range"));

        let instance = h.storage.get_instance_for_user("u1", &instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(h.events.recent_of_kind(EventKind::InstanceFailed, 5).len(), 1);
    }

    #[tokio::test]
    async fn test_task_with_unmet_run_if_is_skipped() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false), (2, true)]);
        template.tasks[0].action = TaskAction::SendEmail { subject: "VIP".into(), body: "b".into() };
        template.tasks[0].run_if = vec![Condition {
            field: "tier".into(),
            operator: ConditionOperator::Equals,
            value: json!("vip"),
            logic: ConditionLogic::And,
        }];
        template.tasks[1].run_if = template.tasks[0].run_if.clone();
        install(&h, &template).await;

        let report = h.engine.dispatch(TriggerType::DealCreated, deal_ctx("u1", "deal-1")).await.unwrap();
        let executions = h.storage.list_executions(&report.started[0]).await.unwrap();

        // Neither the email nor the gate fires; the instance runs to completion
        assert_eq!(executions.len(), 2);
        assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));
        assert_eq!(executions[0].result, Some(json!({ "skipped": true, "reason": "conditions not met" })));
        assert!(h.messaging.emails().is_empty());
        let instance = h.storage.get_instance_for_user("u1", &report.started[0]).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_task_with_met_run_if_runs() {
        let h = harness().await;
        let mut template = template_fixture("u1", &[(1, false)]);
        template.tasks[0].action = TaskAction::SendEmail { subject: "VIP".into(), body: "b".into() };
        template.tasks[0].run_if = vec![Condition {
            field: "tier".into(),
            operator: ConditionOperator::Equals,
            value: json!("vip"),
            logic: ConditionLogic::And,
        }];
        install(&h, &template).await;

        let ctx = deal_ctx("u1", "deal-1").with_variable("tier", "vip");
        h.engine.dispatch(TriggerType::DealCreated, ctx).await.unwrap();
        assert_eq!(h.messaging.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_advance_is_scoped_to_the_owning_tenant() {
        let h = harness().await;
        let template = template_fixture("u1", &[(1, false)]);
        install(&h, &template).await;

        let (_, execution) = h
            .engine
            .start_instance(&template, TriggerType::DealCreated, &deal_ctx("u1", "deal-1"))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(h.engine.advance("u2", &execution.id).await, Err(AppError::NotFound(_))));
        assert_eq!(h.engine.advance("u1", &execution.id).await.unwrap(), AdvanceOutcome::Completed);
    }
}
