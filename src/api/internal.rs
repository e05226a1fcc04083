/// Internal endpoints called by sibling services, not by tenants
///
/// - `POST /internal/triggers/{trigger}`: fire-and-forget trigger. The body is the
///   trigger context (`userId`, `leadId?`, `dealId?`, `variables?`). Returns 202
///   as soon as the trigger is queued; dispatch runs on the worker pool.
/// - `POST /internal/tick`: run one scheduler tick now.

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::workflow::types::{TriggerContext, TriggerType};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};

pub fn create_internal_routes() -> Router<AppState> {
    Router::new()
        .route("/internal/triggers/{trigger}", post(fire_trigger))
        .route("/internal/tick", post(tick))
}

/// POST /internal/triggers/{trigger}
async fn fire_trigger(
    State(state): State<AppState>,
    Path(trigger): Path<String>,
    body: String,
) -> AppResult<(StatusCode, Json<Value>)> {
    let trigger: TriggerType = trigger.parse()?;

    let ctx: TriggerContext = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!("❌ Invalid trigger payload for {}: {}", trigger, e);
        AppError::validation(format!("Invalid trigger payload: {}", e))
    })?;
    if ctx.user_id.trim().is_empty() {
        return Err(AppError::validation("userId is required"));
    }

    tracing::info!("📥 Trigger {} received for user {}", trigger, ctx.user_id);
    let accepted = state.dispatcher.fire(trigger, ctx);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "accepted": accepted, "trigger": trigger })),
    ))
}

/// POST /internal/tick
async fn tick(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let summary = state.ticks.tick_now(Utc::now()).await?;
    Ok(Json(json!({ "success": true, "tick": summary })))
}
