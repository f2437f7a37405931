use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{
    event_types, now_ms, Message, MessageSource, MessageStatus, Participant,
};
use crate::repository::NewMessage;
use crate::websocket::protocol::{sandbox_commands, server_frames};
use crate::websocket::registry::BroadcastMode;

use super::lifecycle::SpawnTrigger;
use super::SessionActor;

/// Models a prompt may run on. Overrides outside this list are dropped with a
/// warning rather than failing the request.
pub const MODEL_ALLOWLIST: &[&str] = &["claude-sonnet-4-5", "claude-opus-4-5", "gpt-5-codex"];

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Reasoning-effort values accepted per model family.
pub fn allowed_efforts(model: &str) -> &'static [&'static str] {
    if model.starts_with("gpt-") {
        &["low", "medium", "high", "xhigh"]
    } else {
        &["low", "medium", "high"]
    }
}

/// A prompt arriving from any source (WS frame, HTTP, integration bot).
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub user_id: String,
    pub content: String,
    pub source: MessageSource,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub attachments: Option<Value>,
    pub callback_context: Option<Value>,
    pub request_id: Option<String>,
    /// Socket the prompt arrived on; `prompt_queued` goes back there.
    pub origin_ws_id: Option<String>,
}

impl SessionActor {
    // ========================================================================
    // Enqueue
    // ========================================================================

    /// FIFO enqueue: persist the message, mirror it into the event log so
    /// replay reproduces the conversation, answer the originator with its
    /// queue position, then try to dispatch.
    pub async fn enqueue_prompt(self: &Arc<Self>, req: PromptRequest) -> AppResult<Message> {
        if req.content.trim().is_empty() {
            return Err(AppError::Validation("Prompt content is required".into()));
        }

        let message = {
            let _guard = self.write_guard.lock().await;
            self.require_active_session().await?;

            let author = self
                .repo
                .ensure_participant(&req.user_id, crate::models::ParticipantRole::Member)
                .await?;

            let model = validate_override(
                req.model.as_deref(),
                MODEL_ALLOWLIST,
                &self.session_id,
                "model",
            );
            let effort_allowlist = allowed_efforts(model.unwrap_or(DEFAULT_MODEL));
            let reasoning_effort = validate_override(
                req.reasoning_effort.as_deref(),
                effort_allowlist,
                &self.session_id,
                "reasoning_effort",
            );

            let attachments_json = req.attachments.as_ref().map(Value::to_string);
            let callback_json = req.callback_context.as_ref().map(Value::to_string);

            let message = self
                .repo
                .insert_message(NewMessage {
                    author_id: &author.id,
                    content: &req.content,
                    source: req.source,
                    model,
                    reasoning_effort,
                    attachments_json: attachments_json.as_deref(),
                    callback_context_json: callback_json.as_deref(),
                })
                .await?;

            // First prompt names the session.
            self.repo
                .set_session_title_if_unset(&derive_title(&req.content))
                .await?;

            // Synthetic user_message event so replay carries the conversation.
            let mirror = json!({
                "type": event_types::USER_MESSAGE,
                "message_id": message.id,
                "content": message.content,
                "source": message.source,
                "author": {
                    "participant_id": author.id,
                    "name": display_name(&author),
                    "login": author.scm_login,
                },
            });
            self.repo
                .insert_event(event_types::USER_MESSAGE, &mirror.to_string(), Some(&message.id))
                .await?;

            let position = self.repo.get_pending_or_processing_count().await?;
            let queued = server_frames::prompt_queued(
                &message.id,
                position,
                req.request_id.as_deref(),
            );
            match &req.origin_ws_id {
                Some(ws_id) => {
                    self.registry.send_to_client(ws_id, &queued).await;
                }
                None => {
                    self.registry
                        .broadcast(BroadcastMode::AuthenticatedOnly, &queued, &self.repo)
                        .await;
                }
            }

            message
        };

        self.dispatch().await?;
        Ok(message)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Advance the queue: at most one message processing at a time, oldest
    /// pending first. With no sandbox connected, dispatch kicks a spawn and
    /// retries when the sandbox connects or the current execution completes.
    pub async fn dispatch(self: &Arc<Self>) -> AppResult<()> {
        let needs_spawn = {
            let _guard = self.write_guard.lock().await;

            if self.repo.get_processing_message().await?.is_some() {
                return Ok(());
            }
            let Some(next) = self.repo.get_next_pending_message().await? else {
                return Ok(());
            };

            if !self.registry.sandbox_connected().await {
                self.registry
                    .broadcast(
                        BroadcastMode::AllClients,
                        &server_frames::sandbox_spawning(),
                        &self.repo,
                    )
                    .await;
                true
            } else {
                let started_at = now_ms();
                if !self
                    .repo
                    .update_message_to_processing(&next.id, started_at)
                    .await?
                {
                    return Ok(());
                }

                let session = self.require_session().await?;
                let model = next.model.clone().unwrap_or(session.model);
                let reasoning_effort = next
                    .reasoning_effort
                    .clone()
                    .or(session.reasoning_effort);

                let author_name = match self.repo.get_participant(&next.author_id).await? {
                    Some(p) => Some(display_name(&p)),
                    None => None,
                };
                let attachments = next
                    .attachments_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok());

                let command = sandbox_commands::prompt(
                    &next.id,
                    &next.content,
                    &model,
                    reasoning_effort.as_deref(),
                    author_name.as_deref(),
                    attachments.as_ref(),
                );
                self.registry.send_to_sandbox(&command).await;

                self.registry
                    .broadcast(
                        BroadcastMode::AllClients,
                        &server_frames::processing_status(true),
                        &self.repo,
                    )
                    .await;
                self.repo.set_last_activity(started_at).await?;
                self.schedule_alarm_at(started_at + self.config.execution_timeout_ms);

                info!(
                    session_id = %self.session_id,
                    message_id = %next.id,
                    model = %model,
                    "Dispatched prompt to sandbox"
                );
                false
            }
        };

        if needs_spawn {
            let actor = self.clone();
            tokio::spawn(async move {
                actor.ensure_sandbox_spawned(SpawnTrigger::Dispatch).await;
            });
        }
        Ok(())
    }

    // ========================================================================
    // Stop / fail-stuck
    // ========================================================================

    /// Abort the in-flight execution: fail the message, synthesize its
    /// completion event, tell the sandbox to stop. Safe to call repeatedly.
    pub async fn stop_execution(&self) -> AppResult<()> {
        let _guard = self.write_guard.lock().await;
        self.abort_processing_locked(true).await?;
        Ok(())
    }

    /// Same terminal bookkeeping as stop, but without talking to a sandbox
    /// that is presumed dead, and without draining the queue.
    pub(crate) async fn fail_stuck_processing_message_locked(&self) -> AppResult<bool> {
        self.abort_processing_locked(false).await
    }

    /// Caller must hold `write_guard`.
    async fn abort_processing_locked(&self, send_stop: bool) -> AppResult<bool> {
        let Some(processing) = self.repo.get_processing_message().await? else {
            return Ok(false);
        };

        self.repo
            .update_message_completion(&processing.id, MessageStatus::Failed)
            .await?;

        let event_data = json!({
            "type": event_types::EXECUTION_COMPLETE,
            "message_id": processing.id,
            "success": false,
            "stopped": true,
        });
        self.repo
            .upsert_execution_complete_event(&processing.id, &event_data.to_string())
            .await?;

        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::sandbox_event(&event_data),
                &self.repo,
            )
            .await;
        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::processing_status(false),
                &self.repo,
            )
            .await;

        if send_stop {
            self.registry.send_to_sandbox(&sandbox_commands::stop()).await;
        }

        info!(
            session_id = %self.session_id,
            message_id = %processing.id,
            sent_stop = send_stop,
            "Aborted processing message"
        );
        Ok(true)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Drop invalid overrides instead of failing the request.
fn validate_override<'a>(
    value: Option<&'a str>,
    allowlist: &[&str],
    session_id: &str,
    field: &str,
) -> Option<&'a str> {
    match value {
        Some(v) if allowlist.contains(&v) => Some(v),
        Some(v) => {
            warn!(session_id, field, value = v, "Dropping invalid override");
            None
        }
        None => None,
    }
}

fn display_name(participant: &Participant) -> String {
    participant
        .scm_name
        .clone()
        .or_else(|| participant.scm_login.clone())
        .unwrap_or_else(|| participant.user_id.clone())
}

/// First line of the first prompt, truncated on a char boundary.
fn derive_title(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    line.chars().take(80).collect()
}
