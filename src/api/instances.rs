/// Workflow instance endpoints: cursor-paged listing, detail, operator pause/resume

use crate::api::{auth::AuthUser, AppState};
use crate::error::{AppError, AppResult};
use crate::workflow::storage::InstanceFilter;
use crate::workflow::types::InstanceStatus;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_PAGE: i64 = 20;
const MAX_PAGE: i64 = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
    pub lead_id: Option<String>,
    pub deal_id: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    #[serde(default)]
    pub reset_failed: bool,
}

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows/instances", get(list_instances))
        .route("/workflows/instances/{id}", get(get_instance))
        .route("/workflows/instances/{id}/pause", post(pause_instance))
        .route("/workflows/instances/{id}/resume", post(resume_instance))
}

/// GET /workflows/instances?status=&leadId=&dealId=&limit=&cursor=
async fn list_instances(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            InstanceStatus::parse(&raw.trim().to_ascii_uppercase())
                .map_err(|_| AppError::validation(format!("Unknown status '{}'", raw)))
        })
        .transpose()?;
    let filter = InstanceFilter {
        status,
        lead_id: query.lead_id,
        deal_id: query.deal_id,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let after = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(cursor) => Some(
            state
                .storage
                .instance_cursor(user.id(), cursor)
                .await?
                .ok_or_else(|| AppError::validation("Unknown cursor"))?,
        ),
        None => None,
    };

    let page = state
        .storage
        .list_instances(user.id(), &filter, after.as_ref(), limit)
        .await?;
    Ok(Json(json!({
        "success": true,
        "instances": page.instances,
        "nextCursor": page.next_cursor,
        "hasMore": page.has_more,
    })))
}

/// GET /workflows/instances/{id}
async fn get_instance(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let instance = state
        .storage
        .get_instance_for_user(user.id(), &id)
        .await?
        .ok_or_else(|| AppError::not_found("Instance"))?;
    let template = state.storage.get_template(user.id(), &instance.template_id).await?;
    let executions = state.storage.list_executions(&instance.id).await?;

    Ok(Json(json!({
        "success": true,
        "instance": instance,
        "template": template,
        "executions": executions,
    })))
}

/// POST /workflows/instances/{id}/pause
async fn pause_instance(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let instance = state.engine.pause_instance(user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "instance": instance })))
}

/// POST /workflows/instances/{id}/resume
/// Body (optional): { "resetFailed": true }
async fn resume_instance(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let request: ResumeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResumeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::validation(format!("Invalid body: {}", e)))?
    };

    let instance = state
        .engine
        .resume_instance(user.id(), &id, request.reset_failed)
        .await?;
    Ok(Json(json!({ "success": true, "instance": instance })))
}
