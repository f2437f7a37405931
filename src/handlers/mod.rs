use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{ArtifactDto, EventCursor, MessageSource, ParticipantDto, ParticipantRole};
use crate::session::pull_request::CreatePrRequest;
use crate::session::queue::PromptRequest;
use crate::session::InitRequest;
use crate::state::AppState;
use crate::websocket::protocol::SandboxEvent;

// ============================================================================
// Shared helpers
// ============================================================================

fn validation_error(errors: validator::ValidationErrors) -> AppError {
    AppError::Validation(errors.to_string().replace('\n', "; "))
}

// ============================================================================
// Health
// ============================================================================

/// GET /health — liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Session bootstrap and inspection
// ============================================================================

/// POST /sessions/:session_id/init — idempotent session bootstrap.
pub async fn init_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<InitRequest>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_or_init(&session_id).await?;
    let response = actor.init(req).await?;
    Ok(Json(response))
}

/// GET /sessions/:session_id/state — current session + sandbox snapshot.
pub async fn get_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    Ok(Json(actor.state().await?))
}

// ============================================================================
// Prompts
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct HttpPromptRequest {
    pub user_id: String,
    #[validate(length(min = 1, max = 100_000, message = "Content must be 1–100 000 characters"))]
    pub content: String,
    pub source: Option<MessageSource>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub attachments: Option<Value>,
    pub callback_context: Option<Value>,
}

/// POST /sessions/:session_id/prompt — enqueue from a non-WebSocket source.
pub async fn post_prompt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<HttpPromptRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    req.validate().map_err(validation_error)?;

    let actor = state.sessions.get_existing(&session_id).await?;
    let message = actor
        .enqueue_prompt(PromptRequest {
            user_id: req.user_id,
            content: req.content,
            source: req.source.unwrap_or(MessageSource::Web),
            model: req.model,
            reasoning_effort: req.reasoning_effort,
            attachments: req.attachments,
            callback_context: req.callback_context,
            request_id: None,
            origin_ws_id: None,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message_id": message.id, "status": "queued" })),
    ))
}

/// POST /sessions/:session_id/stop — abort the in-flight execution.
pub async fn post_stop(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.stop_execution().await?;
    Ok(Json(json!({ "status": "stopping" })))
}

// ============================================================================
// Sandbox event fallback transport
// ============================================================================

/// POST /sessions/:session_id/sandbox-event — ingest from a non-WebSocket
/// sandbox transport.
pub async fn post_sandbox_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    let event = SandboxEvent::from_value(body)
        .ok_or_else(|| AppError::Validation("Event must be an object with a type".into()))?;
    actor.process_sandbox_event(event).await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ============================================================================
// Participants
// ============================================================================

/// GET /sessions/:session_id/participants
pub async fn list_participants(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Vec<ParticipantDto>>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.require_session().await?;
    let participants = actor
        .repo
        .list_participants()
        .await?
        .into_iter()
        .map(ParticipantDto::from)
        .collect();
    Ok(Json(participants))
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub user_id: String,
    pub scm_user_id: Option<String>,
    pub scm_login: Option<String>,
    pub scm_name: Option<String>,
    pub scm_email: Option<String>,
    pub scm_access_token_encrypted: Option<String>,
    pub scm_refresh_token_encrypted: Option<String>,
    pub scm_token_expires_at: Option<i64>,
}

/// POST /sessions/:session_id/participants — join (or update) a participant.
pub async fn join_participant(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> AppResult<(StatusCode, Json<ParticipantDto>)> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id is required".into()));
    }

    let actor = state.sessions.get_existing(&session_id).await?;
    actor.require_session().await?;

    let participant = actor
        .repo
        .ensure_participant(&req.user_id, ParticipantRole::Member)
        .await?;
    actor
        .repo
        .update_participant_scm(
            &participant.id,
            req.scm_user_id.as_deref(),
            req.scm_login.as_deref(),
            req.scm_name.as_deref(),
            req.scm_email.as_deref(),
            req.scm_access_token_encrypted.as_deref(),
            req.scm_refresh_token_encrypted.as_deref(),
            req.scm_token_expires_at,
        )
        .await?;

    let refreshed = actor
        .repo
        .get_participant(&participant.id)
        .await?
        .ok_or(AppError::Internal)?;
    Ok((StatusCode::CREATED, Json(ParticipantDto::from(refreshed))))
}

// ============================================================================
// Events, artifacts, messages
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub timestamp: Option<i64>,
    pub id: Option<String>,
    pub limit: Option<i64>,
}

/// GET /sessions/:session_id/events — cursor-paginated history, newest first
/// entry point.
pub async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.require_session().await?;

    let cursor = EventCursor {
        timestamp: query.timestamp.unwrap_or(i64::MAX),
        id: query.id.unwrap_or_else(|| "\u{10FFFF}".into()),
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let (events, has_more) = actor.repo.get_events_history_page(&cursor, limit).await?;

    let next_cursor = events
        .first()
        .map(|oldest| json!({ "timestamp": oldest.created_at, "id": oldest.id }));
    let items: Vec<Value> = events
        .into_iter()
        .filter_map(|e| e.into_dto())
        .filter_map(|dto| serde_json::to_value(dto).ok())
        .collect();

    Ok(Json(json!({
        "events": items,
        "has_more": has_more,
        "cursor": next_cursor,
    })))
}

/// GET /sessions/:session_id/artifacts
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Vec<ArtifactDto>>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.require_session().await?;
    let artifacts = actor
        .repo
        .list_artifacts()
        .await?
        .into_iter()
        .map(ArtifactDto::from)
        .collect();
    Ok(Json(artifacts))
}

/// GET /sessions/:session_id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.require_session().await?;
    let messages = actor.repo.list_messages().await?;
    Ok(Json(json!({ "messages": messages })))
}

// ============================================================================
// Pull requests
// ============================================================================

/// POST /sessions/:session_id/create-pr
pub async fn create_pr(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CreatePrRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id is required".into()));
    }

    let actor = state.sessions.get_existing(&session_id).await?;
    let outcome = actor.create_pull_request(req).await?;
    Ok((StatusCode::CREATED, Json(outcome.to_json())))
}

// ============================================================================
// Tokens and lifecycle toggles
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

/// POST /sessions/:session_id/ws-token — rotate a participant's WS token.
/// The plaintext is returned exactly once; only the hash is stored.
pub async fn rotate_ws_token(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> AppResult<Json<Value>> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id is required".into()));
    }
    let actor = state.sessions.get_existing(&session_id).await?;
    Ok(Json(actor.rotate_ws_token(&req.user_id).await?))
}

/// POST /sessions/:session_id/archive
pub async fn archive_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.archive(&req.user_id).await?;
    Ok(Json(json!({ "status": "archived" })))
}

/// POST /sessions/:session_id/unarchive
pub async fn unarchive_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.unarchive(&req.user_id).await?;
    Ok(Json(json!({ "status": "active" })))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

/// POST /sessions/:session_id/verify-sandbox-token — constant-time check used
/// by the edge before routing sandbox traffic.
pub async fn verify_sandbox_token(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<TokenRequest>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.verify_sandbox_token(&req.token).await?;
    Ok(Json(json!({ "valid": true })))
}

/// POST /sessions/:session_id/openai-token-refresh — forward a refreshed
/// model-provider credential to the connected sandbox.
pub async fn openai_token_refresh(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<TokenRequest>,
) -> AppResult<Json<Value>> {
    let actor = state.sessions.get_existing(&session_id).await?;
    actor.refresh_provider_credential(&req.token).await?;
    Ok(Json(json!({ "status": "forwarded" })))
}
