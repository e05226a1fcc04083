/// Workflow template REST endpoints
///
/// CRUD for templates with registry hot-reload after every write, plus the
/// tenant's stats and recent engine events.

use crate::api::{auth::AuthUser, AppState};
use crate::error::{AppError, AppResult};
use crate::workflow::types::{validate_tasks, TaskDraft, TemplateDraft, WorkflowTemplate};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AppendTasksRequest {
    pub tasks: Vec<TaskDraft>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows/templates", post(create_template).get(list_templates))
        .route(
            "/workflows/templates/{id}",
            get(get_template).put(replace_template).delete(delete_template),
        )
        .route("/workflows/templates/{id}/status", patch(set_template_status))
        .route("/workflows/templates/{id}/tasks", post(append_tasks))
        .route("/workflows/stats", get(stats))
        .route("/workflows/events", get(events))
}

fn build_template(user_id: &str, id: String, draft: TemplateDraft) -> WorkflowTemplate {
    let now = Utc::now();
    let mut tasks: Vec<_> = draft.tasks.into_iter().map(|t| t.into_task(&id)).collect();
    tasks.sort_by_key(|t| t.display_order);

    WorkflowTemplate {
        id,
        user_id: user_id.to_string(),
        name: draft.name.trim().to_string(),
        description: draft.description,
        trigger_types: draft.trigger_types,
        trigger_config: draft.trigger_config,
        enrollment_mode: draft.enrollment_mode,
        enabled: draft.enabled,
        tasks,
        created_at: now,
        updated_at: now,
    }
}

async fn load_template(state: &AppState, user_id: &str, id: &str) -> AppResult<WorkflowTemplate> {
    state
        .storage
        .get_template(user_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Template"))
}

/// POST /workflows/templates
async fn create_template(
    State(state): State<AppState>,
    user: AuthUser,
    Json(draft): Json<TemplateDraft>,
) -> AppResult<(StatusCode, Json<Value>)> {
    draft.validate()?;
    let template = build_template(user.id(), Uuid::new_v4().to_string(), draft);

    state.storage.insert_template(&template).await?;
    state.registry.reload_template(user.id(), &template.id).await?;

    tracing::info!("🔥 Created template {} ({}) for user {}", template.id, template.name, user.id());
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "template": template }))))
}

/// GET /workflows/templates
async fn list_templates(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Value>> {
    let templates = state.storage.list_templates(user.id()).await?;
    Ok(Json(json!({ "success": true, "templates": templates })))
}

/// GET /workflows/templates/{id}
async fn get_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let template = load_template(&state, user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "template": template })))
}

/// PUT /workflows/templates/{id}
///
/// Full replace. Refused while any RUNNING or PAUSED instance still walks the old definition.
async fn replace_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(draft): Json<TemplateDraft>,
) -> AppResult<Json<Value>> {
    let existing = load_template(&state, user.id(), &id).await?;
    draft.validate()?;

    let active = state.storage.count_active_instances(&id).await?;
    if active > 0 {
        return Err(AppError::conflict(format!(
            "Template has {} active instances and cannot be modified",
            active
        )));
    }

    let mut template = build_template(user.id(), id.clone(), draft);
    template.created_at = existing.created_at;
    if !state.storage.replace_template(&template).await? {
        return Err(AppError::not_found("Template"));
    }
    state.registry.reload_template(user.id(), &id).await?;

    tracing::info!("🔄 Replaced template {} for user {}", id, user.id());
    let template = load_template(&state, user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "template": template })))
}

/// PATCH /workflows/templates/{id}/status
async fn set_template_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> AppResult<Json<Value>> {
    if !state.storage.set_template_enabled(user.id(), &id, body.enabled).await? {
        return Err(AppError::not_found("Template"));
    }
    state.registry.reload_template(user.id(), &id).await?;

    tracing::info!(
        "{} Template {} {}",
        if body.enabled { "▶️" } else { "⏸️" },
        id,
        if body.enabled { "enabled" } else { "disabled" }
    );
    let template = load_template(&state, user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "template": template })))
}

/// POST /workflows/templates/{id}/tasks
///
/// Appending is the one change allowed on a referenced template, and only while it is disabled.
async fn append_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<AppendTasksRequest>,
) -> AppResult<Json<Value>> {
    let template = load_template(&state, user.id(), &id).await?;
    if template.enabled {
        return Err(AppError::conflict("Disable the template before appending tasks"));
    }
    if body.tasks.is_empty() {
        return Err(AppError::validation("At least one task is required"));
    }

    let existing: Vec<i64> = template.tasks.iter().map(|t| t.display_order).collect();
    validate_tasks(&body.tasks, &existing)?;

    let tasks: Vec<_> = body.tasks.into_iter().map(|t| t.into_task(&id)).collect();
    state.storage.append_tasks(user.id(), &id, &tasks).await?;
    state.registry.reload_template(user.id(), &id).await?;

    tracing::info!("➕ Appended {} tasks to template {}", tasks.len(), id);
    let template = load_template(&state, user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "template": template })))
}

/// DELETE /workflows/templates/{id}
///
/// Instances are never deleted, so a template that ever ran stays.
async fn delete_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    load_template(&state, user.id(), &id).await?;

    let instances = state.storage.count_instances(&id).await?;
    if instances > 0 {
        return Err(AppError::conflict(format!(
            "Template has {} instances and cannot be deleted; disable it instead",
            instances
        )));
    }

    if !state.storage.delete_template(user.id(), &id).await? {
        return Err(AppError::not_found("Template"));
    }
    state.registry.remove_template(&id);

    tracing::info!("🗑️ Deleted template {} for user {}", id, user.id());
    Ok(Json(json!({ "success": true, "message": "Template deleted" })))
}

/// GET /workflows/stats
async fn stats(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Value>> {
    let stats = state.storage.stats(user.id()).await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

/// GET /workflows/events?limit=
async fn events(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state.events.recent(user.id(), limit);
    Ok(Json(json!({ "success": true, "events": events })))
}
