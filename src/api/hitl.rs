/// Approval gate endpoints
///
/// Approve and reject sit behind two guards, applied in this order:
/// 1. a per-user sliding-window rate limit (429 with `Retry-After` when exceeded)
/// 2. an idempotency cache: a repeated key for the same execution replays the
///    first successful response byte for byte without touching the gate again.
///    The `Idempotency-Key` header wins over `idempotencyKey` in the body.
///    Duplicates arriving while the first request is in flight wait for it and
///    replay its response.

use crate::api::{auth::AuthUser, AppState};
use crate::error::{AppError, AppResult};
use crate::guard::{CachedResponse, IdempotencyKey};
use crate::runtime::GateDecision;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::future::Future;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "idempotent-replayed";

const APPROVE_SCOPE: &str = "hitl.approve";
const REJECT_SCOPE: &str = "hitl.reject";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub notes: Option<String>,
    #[serde(default)]
    pub pause_workflow: bool,
    pub idempotency_key: Option<String>,
}

pub fn create_hitl_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows/hitl/pending", get(pending))
        .route("/workflows/hitl/{execution_id}/approve", post(approve))
        .route("/workflows/hitl/{execution_id}/reject", post(reject))
}

/// GET /workflows/hitl/pending
async fn pending(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Value>> {
    let approvals = state.storage.pending_approvals(user.id()).await?;
    Ok(Json(json!({ "success": true, "count": approvals.len(), "approvals": approvals })))
}

/// POST /workflows/hitl/{execution_id}/approve
/// Body (optional): { "notes"?, "idempotencyKey"? }
async fn approve(
    State(state): State<AppState>,
    user: AuthUser,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request: ApproveRequest = parse_body(&body)?;
    let key = idempotency_key(&headers, request.idempotency_key);

    guarded(&state, APPROVE_SCOPE, user.id(), &execution_id, key, || {
        state.gate.approve(user.id(), &execution_id, request.notes.as_deref())
    })
    .await
}

/// POST /workflows/hitl/{execution_id}/reject
/// Body (optional): { "notes"?, "pauseWorkflow"?, "idempotencyKey"? }
async fn reject(
    State(state): State<AppState>,
    user: AuthUser,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request: RejectRequest = parse_body(&body)?;
    let key = idempotency_key(&headers, request.idempotency_key);

    guarded(&state, REJECT_SCOPE, user.id(), &execution_id, key, || {
        state
            .gate
            .reject(user.id(), &execution_id, request.notes.as_deref(), request.pause_workflow)
    })
    .await
}

async fn guarded<F, Fut>(
    state: &AppState,
    scope: &'static str,
    user_id: &str,
    execution_id: &str,
    key: Option<String>,
    decide: F,
) -> AppResult<Response>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<GateDecision>>,
{
    if let Err(retry_after_secs) = state.limiter.check(user_id) {
        tracing::warn!("🚦 Rate limit hit on {} by user {}", scope, user_id);
        return Err(AppError::RateLimited { retry_after_secs });
    }

    let cache_key = key.map(|k| IdempotencyKey::new(scope, user_id, execution_id, k));
    let _in_flight = match &cache_key {
        Some(cache_key) => Some(state.idempotency.acquire(cache_key).await),
        None => None,
    };
    if let Some(cache_key) = &cache_key {
        if let Some(cached) = state.idempotency.get(cache_key) {
            tracing::info!("♻️ Replaying {} response for execution {}", scope, execution_id);
            return Ok(replay(cached));
        }
    }

    let decision = decide().await?;
    let body = serde_json::to_vec(&decision)?;
    if let Some(cache_key) = cache_key {
        state.idempotency.put(
            cache_key,
            CachedResponse {
                status: StatusCode::OK.as_u16(),
                body: body.clone(),
            },
        );
    }

    Ok(json_response(StatusCode::OK, body))
}

fn idempotency_key(headers: &HeaderMap, from_body: Option<String>) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| from_body.filter(|v| !v.trim().is_empty()))
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> AppResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::validation(format!("Invalid body: {}", e)))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn replay(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut response = json_response(status, cached.body);
    response
        .headers_mut()
        .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
    response
}
