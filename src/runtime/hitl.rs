/// Human-in-the-loop approval gate
///
/// Resolves executions parked in AWAITING_HITL. Each decision is a tenant-scoped
/// conditional update, so a second decision on the same gate, a decision on
/// someone else's execution and a decision on a missing execution all look the
/// same to the caller: not found.

use crate::error::{AppError, AppResult};
use crate::events::{EngineEvent, EventKind};
use crate::runtime::engine::{schedule_next, NextStep, WorkflowEngine};
use crate::workflow::{
    storage,
    types::{ExecutionStatus, InstanceStatus, TaskExecution},
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

const GATE_NOT_FOUND: &str = "Execution not found or not awaiting approval";

/// Response body of approve/reject
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub success: bool,
    pub execution: TaskExecution,
    pub message: String,
    pub workflow_paused: bool,
}

#[derive(Debug, Clone)]
pub struct HitlGate {
    engine: Arc<WorkflowEngine>,
}

impl HitlGate {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    fn not_found() -> AppError {
        AppError::NotFound(GATE_NOT_FOUND.to_string())
    }

    /// AWAITING_HITL -> APPROVED, then continue with the next task
    pub async fn approve(&self, user_id: &str, execution_id: &str, notes: Option<&str>) -> AppResult<GateDecision> {
        let storage = self.engine.storage();

        let execution = storage
            .get_execution_for_user(user_id, execution_id)
            .await?
            .filter(|e| e.status == ExecutionStatus::AwaitingHitl)
            .ok_or_else(Self::not_found)?;
        let instance = storage
            .get_instance_for_user(user_id, &execution.instance_id)
            .await?
            .ok_or_else(Self::not_found)?;
        let template = storage
            .get_template(user_id, &instance.template_id)
            .await?
            .ok_or_else(|| AppError::conflict("Template of this execution no longer exists"))?;

        let now = Utc::now();
        let mut tx = storage.pool().begin().await?;
        if !storage::decide_gate(&mut *tx, user_id, execution_id, ExecutionStatus::Approved, notes, now).await? {
            // Lost a race with another decision; the transaction rolls back on drop
            return Err(Self::not_found());
        }
        let next = schedule_next(&mut *tx, &template, &instance, execution.display_order, now).await?;
        let decided = storage::fetch_execution(&mut *tx, user_id, execution_id)
            .await?
            .ok_or_else(Self::not_found)?;
        tx.commit().await?;

        tracing::info!("👍 Execution {} approved by {}", execution_id, user_id);
        self.engine.events().record(
            EngineEvent::new(EventKind::HitlApproved, notes.unwrap_or("Approved").to_string())
                .for_user(user_id)
                .instance(&instance.id)
                .execution(execution_id),
        );

        match next {
            NextStep::Scheduled(next_execution) => {
                // The approval is already committed; a failing follow-up shows up on the instance
                if let Err(e) = self.engine.advance(user_id, &next_execution.id).await {
                    tracing::error!("❌ Advancing after approval of {} failed: {}", execution_id, e);
                }
            }
            NextStep::Completed => self.engine.record_completed(&instance),
            NextStep::Held => {}
        }

        Ok(GateDecision {
            success: true,
            execution: decided,
            message: "Task approved".to_string(),
            workflow_paused: false,
        })
    }

    /// AWAITING_HITL -> REJECTED; optionally pause the instance
    pub async fn reject(
        &self,
        user_id: &str,
        execution_id: &str,
        notes: Option<&str>,
        pause_workflow: bool,
    ) -> AppResult<GateDecision> {
        let storage = self.engine.storage();
        let now = Utc::now();

        let mut tx = storage.pool().begin().await?;
        if !storage::decide_gate(&mut *tx, user_id, execution_id, ExecutionStatus::Rejected, notes, now).await? {
            return Err(Self::not_found());
        }
        let decided = storage::fetch_execution(&mut *tx, user_id, execution_id)
            .await?
            .ok_or_else(Self::not_found)?;

        let mut workflow_paused = false;
        if pause_workflow {
            storage::transition_instance(
                &mut *tx,
                &decided.instance_id,
                &[InstanceStatus::Running],
                InstanceStatus::Paused,
                now,
            )
            .await?;
            workflow_paused = storage::fetch_instance(&mut *tx, user_id, &decided.instance_id)
                .await?
                .map_or(false, |i| i.status == InstanceStatus::Paused);
        }
        tx.commit().await?;

        tracing::info!(
            "👎 Execution {} rejected by {} (pause workflow: {})",
            execution_id,
            user_id,
            workflow_paused
        );
        self.engine.events().record(
            EngineEvent::new(EventKind::HitlRejected, notes.unwrap_or("Rejected").to_string())
                .for_user(user_id)
                .instance(&decided.instance_id)
                .execution(execution_id),
        );
        if workflow_paused {
            self.engine.events().record(
                EngineEvent::new(EventKind::InstancePaused, "Paused after rejection")
                    .for_user(user_id)
                    .instance(&decided.instance_id),
            );
        }

        let message = if workflow_paused {
            "Task rejected and workflow paused"
        } else {
            "Task rejected"
        };

        Ok(GateDecision {
            success: true,
            execution: decided,
            message: message.to_string(),
            workflow_paused,
        })
    }
}
