/// SQLite persistence for templates, instances and task executions
///
/// Tenant-facing reads take a `user_id` and filter on it. Multi-row state
/// transitions are expressed as free functions over `&mut SqliteConnection` so the
/// engine can compose several of them inside one transaction.

use crate::db::{from_millis, opt_from_millis, to_millis};
use crate::workflow::types::{
    EnrollmentMode, ExecutionStatus, InstanceStatus, TaskAction, TaskExecution, TriggerType,
    WorkflowInstance, WorkflowTask, WorkflowTemplate,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnection, SqlitePool, SqliteRow},
    Row,
};

/// Storage manager for the workflow tables
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

/// Optional filters for instance listing
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub lead_id: Option<String>,
    pub deal_id: Option<String>,
}

/// Position of the last row of the previous page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceCursor {
    pub started_at: i64,
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePage {
    pub instances: Vec<WorkflowInstance>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// An open approval gate with enough context to decide on it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub execution: TaskExecution,
    pub task_name: String,
    pub template_id: String,
    pub template_name: String,
    pub lead_id: Option<String>,
    pub deal_id: Option<String>,
}

/// A delayed execution whose time has come, with its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueExecution {
    pub user_id: String,
    pub execution_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStats {
    pub total_workflows: i64,
    pub active_instances: i64,
    pub completed_instances: i64,
    pub pending_approvals: i64,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------------
    // Templates
    // ---------------------------------------------------------------------

    /// Insert a template and its tasks atomically
    pub async fn insert_template(&self, template: &WorkflowTemplate) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_templates
                (id, user_id, name, description, trigger_types, trigger_config,
                 enrollment_mode, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.user_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(serde_json::to_string(&template.trigger_types)?)
        .bind(serde_json::to_string(&template.trigger_config)?)
        .bind(template.enrollment_mode.as_str())
        .bind(template.enabled)
        .bind(to_millis(template.created_at))
        .bind(to_millis(template.updated_at))
        .execute(&mut *tx)
        .await?;

        insert_tasks(&mut *tx, &template.user_id, &template.tasks).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Replace a template's definition and task list atomically
    pub async fn replace_template(&self, template: &WorkflowTemplate) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_templates
            SET name = ?, description = ?, trigger_types = ?, trigger_config = ?,
                enrollment_mode = ?, enabled = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&template.name)
        .bind(&template.description)
        .bind(serde_json::to_string(&template.trigger_types)?)
        .bind(serde_json::to_string(&template.trigger_config)?)
        .bind(template.enrollment_mode.as_str())
        .bind(template.enabled)
        .bind(to_millis(template.updated_at))
        .bind(&template.id)
        .bind(&template.user_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM workflow_tasks WHERE template_id = ?")
            .bind(&template.id)
            .execute(&mut *tx)
            .await?;
        insert_tasks(&mut *tx, &template.user_id, &template.tasks).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Append tasks to an existing template
    pub async fn append_tasks(&self, user_id: &str, template_id: &str, tasks: &[WorkflowTask]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_tasks(&mut *tx, user_id, tasks).await?;
        sqlx::query("UPDATE workflow_templates SET updated_at = ? WHERE id = ? AND user_id = ?")
            .bind(to_millis(Utc::now()))
            .bind(template_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_template_enabled(&self, user_id: &str, template_id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_templates SET enabled = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(enabled)
        .bind(to_millis(Utc::now()))
        .bind(template_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_template(&self, user_id: &str, template_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_templates WHERE id = ? AND user_id = ?")
            .bind(template_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Tenant-scoped template lookup
    pub async fn get_template(&self, user_id: &str, template_id: &str) -> Result<Option<WorkflowTemplate>> {
        let row = sqlx::query("SELECT * FROM workflow_templates WHERE id = ? AND user_id = ?")
            .bind(template_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_template(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_templates(&self, user_id: &str) -> Result<Vec<WorkflowTemplate>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_templates WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut templates = Vec::with_capacity(rows.len());
        for row in rows {
            templates.push(self.hydrate_template(&row).await?);
        }
        Ok(templates)
    }

    /// Every enabled template across tenants, for registry initialization
    pub async fn load_all_enabled(&self) -> Result<Vec<WorkflowTemplate>> {
        let rows = sqlx::query("SELECT * FROM workflow_templates WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;

        let mut templates = Vec::with_capacity(rows.len());
        for row in rows {
            templates.push(self.hydrate_template(&row).await?);
        }
        Ok(templates)
    }

    async fn hydrate_template(&self, row: &SqliteRow) -> Result<WorkflowTemplate> {
        let mut template = template_from_row(row)?;
        template.tasks = self.load_tasks(&template.id).await?;
        Ok(template)
    }

    async fn load_tasks(&self, template_id: &str) -> Result<Vec<WorkflowTask>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_tasks WHERE template_id = ? ORDER BY display_order ASC",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Instances of a template that are RUNNING or PAUSED
    pub async fn count_active_instances(&self, template_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM workflow_instances WHERE template_id = ? AND status IN ('RUNNING', 'PAUSED')",
        )
        .bind(template_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_instances(&self, template_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM workflow_instances WHERE template_id = ?")
            .bind(template_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ---------------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------------

    pub async fn get_instance_for_user(&self, user_id: &str, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ? AND user_id = ?")
            .bind(instance_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    /// Resolve a listing cursor (an instance id) to its sort position
    pub async fn instance_cursor(&self, user_id: &str, instance_id: &str) -> Result<Option<InstanceCursor>> {
        let row = sqlx::query("SELECT id, started_at FROM workflow_instances WHERE id = ? AND user_id = ?")
            .bind(instance_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(InstanceCursor {
                started_at: row.try_get("started_at")?,
                id: row.try_get("id")?,
            })),
            None => Ok(None),
        }
    }

    /// One page of instances, newest first (`started_at DESC, id DESC`)
    pub async fn list_instances(
        &self,
        user_id: &str,
        filter: &InstanceFilter,
        after: Option<&InstanceCursor>,
        limit: i64,
    ) -> Result<InstancePage> {
        let status = filter.status.map(|s| s.as_str());
        let (after_started, after_id) = match after {
            Some(cursor) => (Some(cursor.started_at), Some(cursor.id.as_str())),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_instances
            WHERE user_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR lead_id = ?)
              AND (? IS NULL OR deal_id = ?)
              AND (? IS NULL OR started_at < ? OR (started_at = ? AND id < ?))
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(&filter.lead_id)
        .bind(&filter.lead_id)
        .bind(&filter.deal_id)
        .bind(&filter.deal_id)
        .bind(after_started)
        .bind(after_started)
        .bind(after_started)
        .bind(after_id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut instances = rows.iter().map(instance_from_row).collect::<Result<Vec<_>>>()?;
        let has_more = instances.len() as i64 > limit;
        instances.truncate(limit.max(0) as usize);
        let next_cursor = if has_more {
            instances.last().map(|i| i.id.clone())
        } else {
            None
        };

        Ok(InstancePage {
            instances,
            next_cursor,
            has_more,
        })
    }

    // ---------------------------------------------------------------------
    // Executions
    // ---------------------------------------------------------------------

    pub async fn get_execution_for_user(&self, user_id: &str, execution_id: &str) -> Result<Option<TaskExecution>> {
        let row = sqlx::query("SELECT * FROM task_executions WHERE id = ? AND user_id = ?")
            .bind(execution_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    /// All executions of an instance in creation order
    pub async fn list_executions(&self, instance_id: &str) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE instance_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// The most recently created execution of an instance
    pub async fn latest_execution(&self, instance_id: &str) -> Result<Option<TaskExecution>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM task_executions WHERE instance_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    /// PENDING executions of one instance that are due
    pub async fn due_executions_for_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM task_executions
            WHERE instance_id = ? AND user_id = ? AND status = 'PENDING' AND scheduled_for <= ?
            ORDER BY display_order ASC
            "#,
        )
        .bind(instance_id)
        .bind(user_id)
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(r.try_get("id")?)).collect()
    }

    /// PENDING executions of RUNNING instances whose time has come, oldest first
    pub async fn due_executions(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.user_id FROM task_executions e
            JOIN workflow_instances i ON i.id = e.instance_id
            WHERE e.status = 'PENDING' AND e.scheduled_for <= ? AND i.status = 'RUNNING'
            ORDER BY e.scheduled_for ASC, e.id ASC
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(DueExecution {
                    execution_id: r.try_get("id")?,
                    user_id: r.try_get("user_id")?,
                })
            })
            .collect()
    }

    /// Move a PENDING execution to RUNNING if its instance is RUNNING.
    /// Returns false when another caller got there first or the instance is not running.
    pub async fn claim_execution(&self, user_id: &str, execution_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions SET status = 'RUNNING', started_at = ?
            WHERE id = ? AND user_id = ? AND status = 'PENDING'
              AND EXISTS (
                SELECT 1 FROM workflow_instances i
                WHERE i.id = task_executions.instance_id AND i.status = 'RUNNING'
              )
            "#,
        )
        .bind(to_millis(now))
        .bind(execution_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn pending_approvals(&self, user_id: &str) -> Result<Vec<PendingApproval>> {
        let rows = sqlx::query(
            r#"
            SELECT e.*, t.name AS task_name, tpl.id AS tpl_id, tpl.name AS template_name,
                   i.lead_id AS inst_lead_id, i.deal_id AS inst_deal_id
            FROM task_executions e
            JOIN workflow_instances i ON i.id = e.instance_id
            JOIN workflow_templates tpl ON tpl.id = i.template_id
            LEFT JOIN workflow_tasks t ON t.id = e.task_id
            WHERE e.user_id = ? AND e.status = 'AWAITING_HITL'
            ORDER BY e.created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingApproval {
                    execution: execution_from_row(row)?,
                    task_name: row.try_get::<Option<String>, _>("task_name")?.unwrap_or_default(),
                    template_id: row.try_get("tpl_id")?,
                    template_name: row.try_get("template_name")?,
                    lead_id: row.try_get("inst_lead_id")?,
                    deal_id: row.try_get("inst_deal_id")?,
                })
            })
            .collect()
    }

    pub async fn stats(&self, user_id: &str) -> Result<WorkflowStats> {
        let row = sqlx::query(
            r#"
            SELECT
              (SELECT COUNT(*) FROM workflow_templates WHERE user_id = ?1) AS total_workflows,
              (SELECT COUNT(*) FROM workflow_instances WHERE user_id = ?1 AND status = 'RUNNING') AS active_instances,
              (SELECT COUNT(*) FROM workflow_instances WHERE user_id = ?1 AND status = 'COMPLETED') AS completed_instances,
              (SELECT COUNT(*) FROM task_executions WHERE user_id = ?1 AND status = 'AWAITING_HITL') AS pending_approvals
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkflowStats {
            total_workflows: row.try_get("total_workflows")?,
            active_instances: row.try_get("active_instances")?,
            completed_instances: row.try_get("completed_instances")?,
            pending_approvals: row.try_get("pending_approvals")?,
        })
    }
}

// -------------------------------------------------------------------------
// Transaction building blocks
// -------------------------------------------------------------------------

async fn insert_tasks(conn: &mut SqliteConnection, user_id: &str, tasks: &[WorkflowTask]) -> Result<()> {
    for task in tasks {
        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (id, template_id, user_id, name, display_order, is_hitl, delay_minutes, action, run_if)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.template_id)
        .bind(user_id)
        .bind(&task.name)
        .bind(task.display_order)
        .bind(task.is_hitl)
        .bind(task.delay_minutes)
        .bind(serde_json::to_string(&task.action)?)
        .bind(serde_json::to_string(&task.run_if)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn insert_instance(conn: &mut SqliteConnection, instance: &WorkflowInstance) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (id, template_id, user_id, lead_id, deal_id, status, trigger_type, variables,
             started_at, updated_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.template_id)
    .bind(&instance.user_id)
    .bind(&instance.lead_id)
    .bind(&instance.deal_id)
    .bind(instance.status.as_str())
    .bind(instance.trigger_type.to_string())
    .bind(serde_json::to_string(&instance.variables)?)
    .bind(to_millis(instance.started_at))
    .bind(to_millis(instance.updated_at))
    .bind(instance.completed_at.map(to_millis))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert `instance` unless a RUNNING or PAUSED instance of the same template already
/// targets its lead or deal. The check and the insert are one statement, so concurrent
/// dispatches for the same entity cannot both get through. Instances without a lead
/// or deal are always inserted.
pub async fn insert_instance_if_new(conn: &mut SqliteConnection, instance: &WorkflowInstance) -> Result<bool> {
    if instance.lead_id.is_none() && instance.deal_id.is_none() {
        insert_instance(conn, instance).await?;
        return Ok(true);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (id, template_id, user_id, lead_id, deal_id, status, trigger_type, variables,
             started_at, updated_at, completed_at)
        SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM workflow_instances
            WHERE template_id = ?
              AND status IN ('RUNNING', 'PAUSED')
              AND ((? IS NOT NULL AND lead_id = ?) OR (? IS NOT NULL AND deal_id = ?))
        )
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.template_id)
    .bind(&instance.user_id)
    .bind(&instance.lead_id)
    .bind(&instance.deal_id)
    .bind(instance.status.as_str())
    .bind(instance.trigger_type.to_string())
    .bind(serde_json::to_string(&instance.variables)?)
    .bind(to_millis(instance.started_at))
    .bind(to_millis(instance.updated_at))
    .bind(instance.completed_at.map(to_millis))
    .bind(&instance.template_id)
    .bind(&instance.lead_id)
    .bind(&instance.lead_id)
    .bind(&instance.deal_id)
    .bind(&instance.deal_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn insert_execution(conn: &mut SqliteConnection, execution: &TaskExecution) -> Result<()> {
    let result = execution
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO task_executions
            (id, instance_id, task_id, user_id, display_order, status, scheduled_for,
             started_at, finished_at, notes, result, error, decided_by, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&execution.id)
    .bind(&execution.instance_id)
    .bind(&execution.task_id)
    .bind(&execution.user_id)
    .bind(execution.display_order)
    .bind(execution.status.as_str())
    .bind(to_millis(execution.scheduled_for))
    .bind(execution.started_at.map(to_millis))
    .bind(execution.finished_at.map(to_millis))
    .bind(&execution.notes)
    .bind(result)
    .bind(&execution.error)
    .bind(&execution.decided_by)
    .bind(to_millis(execution.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Conditionally move an instance between statuses; returns whether a row changed
pub async fn transition_instance(
    conn: &mut SqliteConnection,
    instance_id: &str,
    from: &[InstanceStatus],
    to: InstanceStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let allowed = serde_json::to_string(&from.iter().map(|s| s.as_str()).collect::<Vec<_>>())?;
    let completed_at = matches!(to, InstanceStatus::Completed).then(|| to_millis(now));

    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
        WHERE id = ? AND status IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(to.as_str())
    .bind(to_millis(now))
    .bind(completed_at)
    .bind(instance_id)
    .bind(allowed)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Terminal update for a RUNNING execution
pub async fn finish_execution(
    conn: &mut SqliteConnection,
    execution_id: &str,
    status: ExecutionStatus,
    result: Option<&Value>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = result.map(serde_json::to_string).transpose()?;
    let updated = sqlx::query(
        r#"
        UPDATE task_executions SET status = ?, result = ?, error = ?, finished_at = ?
        WHERE id = ? AND status = 'RUNNING'
        "#,
    )
    .bind(status.as_str())
    .bind(result)
    .bind(error)
    .bind(to_millis(now))
    .bind(execution_id)
    .execute(&mut *conn)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Park a RUNNING execution at its approval gate
pub async fn open_gate(conn: &mut SqliteConnection, execution_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE task_executions SET status = 'AWAITING_HITL' WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(execution_id)
    .execute(&mut *conn)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Close an approval gate owned by `user_id`. Zero rows means the execution does not
/// exist, belongs to someone else, or is not awaiting a decision.
pub async fn decide_gate(
    conn: &mut SqliteConnection,
    user_id: &str,
    execution_id: &str,
    decision: ExecutionStatus,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE task_executions
        SET status = ?, notes = ?, decided_by = ?, finished_at = ?
        WHERE id = ? AND user_id = ? AND status = 'AWAITING_HITL'
        "#,
    )
    .bind(decision.as_str())
    .bind(notes)
    .bind(user_id)
    .bind(to_millis(now))
    .bind(execution_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub async fn fetch_execution(
    conn: &mut SqliteConnection,
    user_id: &str,
    execution_id: &str,
) -> Result<Option<TaskExecution>> {
    let row = sqlx::query("SELECT * FROM task_executions WHERE id = ? AND user_id = ?")
        .bind(execution_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(execution_from_row).transpose()
}

pub async fn fetch_instance(
    conn: &mut SqliteConnection,
    user_id: &str,
    instance_id: &str,
) -> Result<Option<WorkflowInstance>> {
    let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ? AND user_id = ?")
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(instance_from_row).transpose()
}

// -------------------------------------------------------------------------
// Row mapping
// -------------------------------------------------------------------------

fn template_from_row(row: &SqliteRow) -> Result<WorkflowTemplate> {
    let trigger_types: String = row.try_get("trigger_types")?;
    let trigger_config: String = row.try_get("trigger_config")?;
    let mode: String = row.try_get("enrollment_mode")?;

    Ok(WorkflowTemplate {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        trigger_types: serde_json::from_str(&trigger_types)?,
        trigger_config: serde_json::from_str(&trigger_config)?,
        enrollment_mode: EnrollmentMode::parse(&mode)?,
        enabled: row.try_get("enabled")?,
        tasks: Vec::new(),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<WorkflowTask> {
    let action: String = row.try_get("action")?;
    let action: TaskAction = serde_json::from_str(&action)?;
    let run_if: String = row.try_get("run_if")?;

    Ok(WorkflowTask {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        name: row.try_get("name")?,
        display_order: row.try_get("display_order")?,
        is_hitl: row.try_get("is_hitl")?,
        delay_minutes: row.try_get("delay_minutes")?,
        action,
        run_if: serde_json::from_str(&run_if)?,
    })
}

fn instance_from_row(row: &SqliteRow) -> Result<WorkflowInstance> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_type")?;
    let variables: String = row.try_get("variables")?;

    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        user_id: row.try_get("user_id")?,
        lead_id: row.try_get("lead_id")?,
        deal_id: row.try_get("deal_id")?,
        status: InstanceStatus::parse(&status)?,
        trigger_type: trigger.parse::<TriggerType>()?,
        variables: serde_json::from_str(&variables)?,
        started_at: from_millis(row.try_get("started_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        completed_at: opt_from_millis(row.try_get("completed_at")?),
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<TaskExecution> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(TaskExecution {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        display_order: row.try_get("display_order")?,
        status: ExecutionStatus::parse(&status)?,
        scheduled_for: from_millis(row.try_get("scheduled_for")?),
        started_at: opt_from_millis(row.try_get("started_at")?),
        finished_at: opt_from_millis(row.try_get("finished_at")?),
        notes: row.try_get("notes")?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error: row.try_get("error")?,
        decided_by: row.try_get("decided_by")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}
