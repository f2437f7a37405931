use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::MessageSource;
use crate::session::lifecycle::SpawnTrigger;
use crate::session::presence::HistoryResult;
use crate::session::queue::PromptRequest;
use crate::session::SessionActor;
use crate::state::AppState;

use super::protocol::{close_codes, server_frames, ClientFrame, SandboxEvent};
use super::registry::{ClientInfo, Outbound};

// ============================================================================
// Client upgrade
// ============================================================================

/// GET /sessions/:session_id/ws — client socket upgrade.
///
/// The upgrade itself is unauthenticated; the socket has the configured auth
/// window to send a `subscribe` with a valid token before it is closed 4008.
pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let actor = match state.sessions.get_existing(&session_id).await {
        Ok(actor) => actor,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_client_socket(socket, actor))
}

async fn handle_client_socket(socket: WebSocket, actor: Arc<SessionActor>) {
    let ws_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    actor.registry.accept_client(&ws_id, tx).await;

    // Auth-timeout watchdog: unauthenticated sockets are shed.
    {
        let actor = actor.clone();
        let ws_id = ws_id.clone();
        tokio::spawn(async move {
            actor
                .registry
                .enforce_auth_timeout(
                    &ws_id,
                    Duration::from_millis(actor.config.client_auth_timeout_ms),
                    &actor.repo,
                )
                .await;
        });
    }

    // Forward outbound frames from the registry channel to the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Inbound frames from the client.
    let recv_actor = actor.clone();
    let recv_ws_id = ws_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&recv_actor, &recv_ws_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(
                        session_id = %recv_actor.session_id,
                        error = ?e,
                        "Client socket receive error"
                    );
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Disconnect bookkeeping; the durable mapping stays so the identity
    // survives a reconnect with the same ws id after a process restart.
    let leaving = actor.registry.get_client(&ws_id).await;
    actor.registry.remove_client(&ws_id).await;
    if let Some(info) = leaving {
        actor.broadcast_presence_leave(&info.participant_id).await;
        actor.broadcast_presence_sync().await;
    }
}

async fn handle_client_frame(actor: &Arc<SessionActor>, ws_id: &str, text: &str) {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        // Bad JSON is answered, not disconnected.
        actor
            .registry
            .send_to_client(ws_id, &server_frames::error("BAD_FRAME", "Unparseable frame"))
            .await;
        return;
    };

    match frame {
        ClientFrame::Ping => {
            actor.registry.pong(ws_id).await;
        }

        ClientFrame::Subscribe { token, client_id } => {
            handle_subscribe(actor, ws_id, &token, &client_id).await;
        }

        ClientFrame::Prompt {
            content,
            model,
            reasoning_effort,
            attachments,
            request_id,
        } => {
            let Some(info) = require_identity(actor, ws_id).await else {
                return;
            };
            let Some(participant) = lookup_participant(actor, ws_id, &info).await else {
                return;
            };

            let request = PromptRequest {
                user_id: participant.user_id,
                content,
                source: MessageSource::Web,
                model,
                reasoning_effort,
                attachments,
                callback_context: None,
                request_id,
                origin_ws_id: Some(ws_id.to_owned()),
            };
            if let Err(e) = actor.enqueue_prompt(request).await {
                actor
                    .registry
                    .send_to_client(ws_id, &error_frame(&e))
                    .await;
            }
        }

        ClientFrame::Stop => {
            if require_identity(actor, ws_id).await.is_none() {
                return;
            }
            if let Err(e) = actor.stop_execution().await {
                actor
                    .registry
                    .send_to_client(ws_id, &error_frame(&e))
                    .await;
            }
        }

        ClientFrame::Typing => {
            if require_identity(actor, ws_id).await.is_none() {
                return;
            }
            // Typing warms the sandbox so the first prompt lands hot.
            let actor = actor.clone();
            tokio::spawn(async move {
                actor.ensure_sandbox_spawned(SpawnTrigger::Typing).await;
            });
        }

        ClientFrame::FetchHistory { cursor, limit } => {
            if require_identity(actor, ws_id).await.is_none() {
                return;
            }
            match actor.fetch_history(ws_id, &cursor, limit).await {
                Ok(HistoryResult::Page(page)) => {
                    actor.registry.send_to_client(ws_id, &page).await;
                }
                Ok(HistoryResult::RateLimited) => {
                    actor
                        .registry
                        .send_to_client(
                            ws_id,
                            &server_frames::error("RATE_LIMITED", "History requests are limited"),
                        )
                        .await;
                }
                Err(e) => {
                    actor
                        .registry
                        .send_to_client(ws_id, &error_frame(&e))
                        .await;
                }
            }
        }

        ClientFrame::Presence { status, .. } => {
            let Some(info) = require_identity(actor, ws_id).await else {
                return;
            };
            if !matches!(status.as_str(), "online" | "away" | "active" | "idle") {
                return;
            }
            actor
                .broadcast_presence_update(&info.participant_id, &status)
                .await;
        }
    }
}

async fn handle_subscribe(actor: &Arc<SessionActor>, ws_id: &str, token: &str, client_id: &str) {
    let participant = match actor.authenticate_ws_token(token).await {
        Ok(p) => p,
        Err(e) => {
            actor
                .registry
                .send_to_client(ws_id, &error_frame(&e))
                .await;
            actor
                .registry
                .close_client(ws_id, close_codes::AUTH_INVALID, "Invalid or expired token")
                .await;
            return;
        }
    };

    actor
        .registry
        .set_client(
            ws_id,
            ClientInfo {
                participant_id: participant.id.clone(),
                client_id: client_id.to_owned(),
            },
        )
        .await;
    if let Err(e) = actor
        .repo
        .persist_ws_mapping(ws_id, &participant.id, client_id)
        .await
    {
        tracing::warn!(
            session_id = %actor.session_id,
            error = %e,
            "Failed to persist ws mapping"
        );
    }

    match actor.build_subscribed_payload(&participant).await {
        Ok(payload) => {
            actor.registry.send_to_client(ws_id, &payload).await;
            actor.broadcast_presence_sync().await;
        }
        Err(e) => {
            actor
                .registry
                .send_to_client(ws_id, &error_frame(&e))
                .await;
        }
    }
}

/// Identity from the in-memory cache, falling back to the persisted mapping.
/// Sockets with neither are told to authenticate and closed.
async fn require_identity(actor: &Arc<SessionActor>, ws_id: &str) -> Option<ClientInfo> {
    if let Some(info) = actor.registry.recover_client(ws_id, &actor.repo).await {
        return Some(info);
    }
    actor
        .registry
        .send_to_client(
            ws_id,
            &server_frames::error("AUTH_REQUIRED", "Subscribe before sending commands"),
        )
        .await;
    actor
        .registry
        .close_client(ws_id, close_codes::AUTH_INVALID, "Authentication required")
        .await;
    None
}

async fn lookup_participant(
    actor: &Arc<SessionActor>,
    ws_id: &str,
    info: &ClientInfo,
) -> Option<crate::models::Participant> {
    match actor.repo.get_participant(&info.participant_id).await {
        Ok(Some(p)) => Some(p),
        Ok(None) => {
            // Mapping points at a participant that no longer exists; the
            // identity is unrecoverable.
            actor
                .registry
                .close_client(ws_id, close_codes::MAPPING_LOST, "Client mapping lost")
                .await;
            None
        }
        Err(e) => {
            actor
                .registry
                .send_to_client(ws_id, &error_frame(&e))
                .await;
            None
        }
    }
}

fn error_frame(e: &AppError) -> serde_json::Value {
    let code = match e {
        AppError::Auth(_) => "AUTH",
        AppError::Validation(_) => "VALIDATION",
        AppError::NotFound(_) => "NOT_FOUND",
        AppError::Conflict(_) => "CONFLICT",
        AppError::Forbidden(_) => "FORBIDDEN",
        AppError::Gone(_) => "GONE",
        _ => "INTERNAL",
    };
    server_frames::error(code, &e.to_string())
}

// ============================================================================
// Sandbox upgrade
// ============================================================================

/// GET /sessions/:session_id/sandbox/ws — sandbox socket upgrade.
///
/// Requires `Authorization: Bearer <token>` and `X-Sandbox-ID`. The token is
/// verified against the stored hash in constant time; terminal sandboxes are
/// refused with 410 so a stopped sandbox stops retrying.
pub async fn sandbox_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
) -> Response {
    let actor = match state.sessions.get_existing(&session_id).await {
        Ok(actor) => actor,
        Err(e) => return e.into_response(),
    };

    let Some(TypedHeader(Authorization(bearer))) = auth else {
        return (StatusCode::UNAUTHORIZED, "Bearer token required").into_response();
    };

    let presented_id = match headers.get("x-sandbox-id").and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_owned(),
        None => return (StatusCode::BAD_REQUEST, "X-Sandbox-ID required").into_response(),
    };

    let sandbox = match actor.repo.get_sandbox().await {
        Ok(Some(sandbox)) => sandbox,
        Ok(None) => return (StatusCode::NOT_FOUND, "Sandbox not initialized").into_response(),
        Err(e) => return e.into_response(),
    };

    if sandbox.provider_sandbox_id.as_deref() != Some(presented_id.as_str()) {
        return (StatusCode::FORBIDDEN, "Unknown sandbox id").into_response();
    }

    if let Err(e) = actor.verify_sandbox_token(bearer.token()).await {
        return e.into_response();
    }

    ws.on_upgrade(move |socket| handle_sandbox_socket(socket, actor, presented_id))
}

async fn handle_sandbox_socket(socket: WebSocket, actor: Arc<SessionActor>, sandbox_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let replaced = actor.registry.accept_sandbox(&sandbox_id, tx.clone()).await;
    if replaced {
        tracing::info!(
            session_id = %actor.session_id,
            sandbox_id = %sandbox_id,
            "Replaced a previous sandbox socket"
        );
    }

    if let Err(e) = actor.on_sandbox_connected().await {
        tracing::error!(
            session_id = %actor.session_id,
            error = %e,
            "Sandbox connect bookkeeping failed"
        );
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let recv_actor = actor.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Some(event) = SandboxEvent::parse(&text) else {
                        tracing::debug!(
                            session_id = %recv_actor.session_id,
                            "Dropping unparseable sandbox frame"
                        );
                        continue;
                    };
                    if let Err(e) = recv_actor.process_sandbox_event(event).await {
                        tracing::error!(
                            session_id = %recv_actor.session_id,
                            error = %e,
                            "Sandbox event processing failed"
                        );
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(
                        session_id = %recv_actor.session_id,
                        error = ?e,
                        "Sandbox socket receive error"
                    );
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Only clear the slot if a replacement has not already taken it. Sandbox
    // status is left untouched so a bridge reconnect can resume; the alarm
    // below notices if it never does.
    actor.registry.clear_sandbox_if_match(&tx).await;
    actor.schedule_alarm_at(crate::models::now_ms() + actor.config.heartbeat_timeout_ms);
    tracing::info!(
        session_id = %actor.session_id,
        sandbox_id = %sandbox_id,
        "Sandbox socket closed"
    );
}
