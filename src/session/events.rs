use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{event_types, now_ms, MessageStatus};
use crate::websocket::protocol::{sandbox_commands, server_frames, SandboxEvent};
use crate::websocket::registry::BroadcastMode;

use super::SessionActor;

/// Tool-call statuses worth persisting; everything else is broadcast-only
/// noise (progress spinners and the like).
const PERSISTED_TOOL_CALL_STATUSES: &[&str] = &["running", "done", "error"];

/// Result of a push rendezvous. Failures resolve, they do not throw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl PushOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

fn normalize_branch(branch: &str) -> String {
    branch.trim().to_lowercase()
}

impl SessionActor {
    // ========================================================================
    // Ingest
    // ========================================================================

    /// Authoritative ingest of one event from the sandbox, from either the
    /// WebSocket or the HTTP fallback transport. At-least-once delivery is
    /// expected: persistence is idempotent for the deterministic-ID types and
    /// critical events are acknowledged so the sandbox stops re-sending them.
    pub async fn process_sandbox_event(self: &Arc<Self>, event: SandboxEvent) -> AppResult<()> {
        match event.event_type.as_str() {
            event_types::HEARTBEAT => {
                // Health only: update the row, no persistence, no broadcast.
                self.repo.set_last_heartbeat(now_ms()).await?;
            }

            event_types::TOKEN => {
                if let Some(message_id) = &event.message_id {
                    let _guard = self.write_guard.lock().await;
                    self.repo
                        .upsert_token_event(message_id, &event.data.to_string())
                        .await?;
                    self.broadcast_event(&event.data).await;
                }
                // Token stream does not count as activity; a runaway
                // generation must not keep the sandbox alive forever.
            }

            event_types::STEP_START | event_types::STEP_FINISH => {
                self.broadcast_event(&event.data).await;
                self.mark_activity().await?;
            }

            event_types::TOOL_CALL => {
                let status = event.data["status"].as_str().unwrap_or_default();
                if PERSISTED_TOOL_CALL_STATUSES.contains(&status) {
                    let _guard = self.write_guard.lock().await;
                    self.repo
                        .insert_event(
                            event_types::TOOL_CALL,
                            &event.data.to_string(),
                            event.message_id.as_deref(),
                        )
                        .await?;
                }
                self.broadcast_event(&event.data).await;
                self.mark_activity().await?;

                if status == "running" {
                    self.fire_tool_call_callback(&event).await?;
                }
            }

            event_types::TOOL_RESULT => {
                let _guard = self.write_guard.lock().await;
                self.repo
                    .insert_event(
                        event_types::TOOL_RESULT,
                        &event.data.to_string(),
                        event.message_id.as_deref(),
                    )
                    .await?;
                drop(_guard);
                self.broadcast_event(&event.data).await;
            }

            event_types::GIT_SYNC => {
                let _guard = self.write_guard.lock().await;
                self.repo
                    .insert_event(
                        event_types::GIT_SYNC,
                        &event.data.to_string(),
                        event.message_id.as_deref(),
                    )
                    .await?;
                if let Some(status) = event.data["status"].as_str() {
                    self.repo.set_git_sync_status(status).await?;
                }
                if let Some(sha) = event.data["sha"].as_str() {
                    self.repo.set_current_sha(sha).await?;
                }
                drop(_guard);
                self.broadcast_event(&event.data).await;
            }

            event_types::PUSH_COMPLETE | event_types::PUSH_ERROR => {
                {
                    let _guard = self.write_guard.lock().await;
                    self.repo
                        .insert_event(
                            &event.event_type,
                            &event.data.to_string(),
                            event.message_id.as_deref(),
                        )
                        .await?;
                }
                self.resolve_push_rendezvous(&event.event_type, &event.data);
                self.broadcast_event(&event.data).await;
            }

            event_types::EXECUTION_COMPLETE => {
                self.handle_execution_complete(&event).await?;
            }

            // Unknown types a newer sandbox emits: keep them verbatim so
            // replay stays complete.
            other => {
                debug!(
                    session_id = %self.session_id,
                    event_type = other,
                    "Persisting unrecognized sandbox event"
                );
                let _guard = self.write_guard.lock().await;
                self.repo
                    .insert_event(other, &event.data.to_string(), event.message_id.as_deref())
                    .await?;
                drop(_guard);
                self.broadcast_event(&event.data).await;
            }
        }

        // At-least-once acknowledgement, critical types only.
        if let Some(ack_id) = &event.ack_id {
            if event_types::is_critical(&event.event_type) {
                self.registry
                    .send_to_sandbox(&sandbox_commands::ack(ack_id))
                    .await;
            }
        }

        Ok(())
    }

    async fn handle_execution_complete(self: &Arc<Self>, event: &SandboxEvent) -> AppResult<()> {
        {
            let _guard = self.write_guard.lock().await;

            let message_id = match &event.message_id {
                Some(id) => Some(id.clone()),
                None => self
                    .repo
                    .get_processing_message()
                    .await?
                    .map(|m| m.id),
            };

            if let Some(message_id) = &message_id {
                let success = event.data["success"].as_bool().unwrap_or(false);
                self.repo
                    .upsert_execution_complete_event(message_id, &event.data.to_string())
                    .await?;

                let status = if success {
                    MessageStatus::Completed
                } else {
                    MessageStatus::Failed
                };
                // False when stop got there first; the stop outcome stands
                // and only the broadcast below goes out.
                let transitioned = self
                    .repo
                    .update_message_completion(message_id, status)
                    .await?;

                if transitioned {
                    if let Some(t) = self.repo.get_message_timestamps(message_id).await? {
                        let completed = t.completed_at.unwrap_or_else(now_ms);
                        let started = t.started_at.unwrap_or(t.created_at);
                        info!(
                            session_id = %self.session_id,
                            message_id = %message_id,
                            success,
                            queue_ms = started - t.created_at,
                            processing_ms = completed - started,
                            total_ms = completed - t.created_at,
                            "prompt.complete"
                        );
                    }

                    if let Some(message) = self.repo.get_message(message_id).await? {
                        if let Some(ctx) = message
                            .callback_context_json
                            .as_deref()
                            .and_then(|j| serde_json::from_str::<Value>(j).ok())
                        {
                            self.callbacks.fire_execution_complete(ctx, success);
                        }
                    }
                }
            }

            // Persistence and the processing_status flip leave in one step.
            self.broadcast_event(&event.data).await;
            self.registry
                .broadcast(
                    BroadcastMode::AllClients,
                    &server_frames::processing_status(false),
                    &self.repo,
                )
                .await;
        }

        let actor = self.clone();
        tokio::spawn(async move {
            actor.trigger_snapshot("execution_complete").await;
        });

        self.mark_activity().await?;
        self.schedule_alarm_at(now_ms() + self.config.inactivity_timeout_ms);
        self.dispatch().await
    }

    async fn fire_tool_call_callback(&self, event: &SandboxEvent) -> AppResult<()> {
        let Some(processing) = self.repo.get_processing_message().await? else {
            return Ok(());
        };
        if let Some(ctx) = processing
            .callback_context_json
            .as_deref()
            .and_then(|j| serde_json::from_str::<Value>(j).ok())
        {
            self.callbacks.fire_tool_call(ctx, event.data.clone());
        }
        Ok(())
    }

    async fn broadcast_event(&self, data: &Value) {
        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::sandbox_event(data),
                &self.repo,
            )
            .await;
    }

    // ========================================================================
    // Push rendezvous
    // ========================================================================

    /// Ask the sandbox to push a branch and wait for the matching
    /// `push_complete`/`push_error` event, bounded by the push deadline.
    ///
    /// With no sandbox connected the push resolves successfully — the caller
    /// falls back to instructing the user to push manually.
    pub async fn push_branch_to_remote(&self, branch_name: &str, push_spec: Value) -> PushOutcome {
        if !self.registry.sandbox_connected().await {
            return PushOutcome::ok();
        }

        let key = normalize_branch(branch_name);
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.push_waiters.lock().unwrap_or_else(|e| e.into_inner());
            if waiters.contains_key(&key) {
                return PushOutcome::failed("A push for this branch is already in flight");
            }
            waiters.insert(key.clone(), tx);
        }

        if !self
            .registry
            .send_to_sandbox(&sandbox_commands::push(&push_spec))
            .await
        {
            self.remove_push_waiter(&key);
            // Socket vanished between the check and the send; treat as the
            // no-sandbox case.
            return PushOutcome::ok();
        }

        match tokio::time::timeout(Duration::from_millis(self.config.push_timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.remove_push_waiter(&key);
                PushOutcome::failed("Push resolver dropped")
            }
            Err(_) => {
                self.remove_push_waiter(&key);
                warn!(
                    session_id = %self.session_id,
                    branch = %branch_name,
                    "Push timed out"
                );
                PushOutcome::failed("Push timed out")
            }
        }
    }

    fn remove_push_waiter(&self, key: &str) {
        self.push_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn resolve_push_rendezvous(&self, event_type: &str, data: &Value) {
        let Some(branch) = data["branch"].as_str() else {
            return;
        };
        let key = normalize_branch(branch);
        let waiter = self
            .push_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);

        let Some(tx) = waiter else {
            return;
        };
        let outcome = if event_type == event_types::PUSH_COMPLETE {
            PushOutcome::ok()
        } else {
            PushOutcome::failed(
                data["error"]
                    .as_str()
                    .unwrap_or("Push failed")
                    .to_owned(),
            )
        };
        let _ = tx.send(outcome);
    }
}
