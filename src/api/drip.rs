/// Drip sequence endpoints

use crate::api::{auth::AuthUser, AppState};
use crate::drip::{ContactDraft, SequenceDraft};
use crate::error::AppResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_drip_routes() -> Router<AppState> {
    Router::new()
        .route("/drip/sequences", post(create_sequence).get(list_sequences))
        .route("/drip/sequences/{id}", get(get_sequence))
        .route("/drip/sequences/{id}/enrollments", post(enroll).get(list_enrollments))
        .route("/drip/enrollments/{id}/reply", post(record_reply))
        .route("/drip/enrollments/{id}/cancel", post(cancel))
}

/// POST /drip/sequences
async fn create_sequence(
    State(state): State<AppState>,
    user: AuthUser,
    Json(draft): Json<SequenceDraft>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let sequence = state.drip.create_sequence(user.id(), draft).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "sequence": sequence }))))
}

/// GET /drip/sequences
async fn list_sequences(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Value>> {
    let sequences = state.drip.list_sequences(user.id()).await?;
    Ok(Json(json!({ "success": true, "sequences": sequences })))
}

/// GET /drip/sequences/{id}
async fn get_sequence(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let sequence = state.drip.get_sequence(user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "sequence": sequence })))
}

/// POST /drip/sequences/{id}/enrollments
async fn enroll(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(contact): Json<ContactDraft>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let enrollment = state.drip.enroll(user.id(), &id, contact).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "enrollment": enrollment }))))
}

/// GET /drip/sequences/{id}/enrollments
async fn list_enrollments(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let enrollments = state.drip.list_enrollments(user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "enrollments": enrollments })))
}

/// POST /drip/enrollments/{id}/reply
async fn record_reply(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let enrollment = state.drip.record_reply(user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "enrollment": enrollment })))
}

/// POST /drip/enrollments/{id}/cancel
async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let enrollment = state.drip.cancel(user.id(), &id).await?;
    Ok(Json(json!({ "success": true, "enrollment": enrollment })))
}
