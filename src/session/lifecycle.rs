use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::AppResult;
use crate::models::{now_ms, Sandbox, SandboxStatus};
use crate::providers::{merged_secrets, SandboxConfig};
use crate::websocket::protocol::{sandbox_commands, server_frames};
use crate::websocket::registry::BroadcastMode;

use super::{generate_token, SessionActor};

/// Why a spawn was requested; drives the user-facing broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnTrigger {
    /// Session init warms a sandbox before the first prompt.
    Warm,
    /// A participant started typing.
    Typing,
    /// Dispatch found a pending prompt and no sandbox.
    Dispatch,
}

/// What the persisted sandbox state says a spawn request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnAction {
    /// A sandbox is already serving the session.
    Skip,
    /// A spawn or connect is in flight; let it finish.
    Wait,
    /// Terminal sandbox with a snapshot to resume from.
    Restore,
    Spawn,
}

/// An in-flight spawn older than this is considered abandoned (process died
/// mid-spawn) and may be retried.
const IN_FLIGHT_GRACE_MS: i64 = 5 * 60 * 1000;

/// Remaining idle time below which clients get a heads-up broadcast.
const INACTIVITY_WARNING_MS: i64 = 5 * 60 * 1000;

fn decide_spawn_action(sandbox: &Sandbox, now: i64, supports_restore: bool) -> SpawnAction {
    if sandbox.status.is_live() {
        return SpawnAction::Skip;
    }
    if sandbox.status.is_in_flight() && now - sandbox.created_at < IN_FLIGHT_GRACE_MS {
        return SpawnAction::Wait;
    }
    if sandbox.status.is_terminal() && sandbox.snapshot_image_id.is_some() && supports_restore {
        return SpawnAction::Restore;
    }
    SpawnAction::Spawn
}

impl SessionActor {
    // ========================================================================
    // Spawn decision
    // ========================================================================

    /// Entry point for warm, typing, and dispatch triggers. Never fails the
    /// caller; spawn problems surface as broadcasts and persisted state.
    pub async fn ensure_sandbox_spawned(self: &Arc<Self>, trigger: SpawnTrigger) {
        if let Err(e) = self.try_spawn(trigger).await {
            error!(
                session_id = %self.session_id,
                error = %e,
                "Sandbox spawn attempt failed"
            );
        }
    }

    async fn try_spawn(self: &Arc<Self>, trigger: SpawnTrigger) -> AppResult<()> {
        let Some(sandbox) = self.repo.get_sandbox().await? else {
            return Ok(());
        };

        // Circuit breaker: repeated permanent failures disable spawning for
        // the open window, then one attempt closes or re-opens it.
        let now = now_ms();
        if sandbox.spawn_failure_count >= self.config.spawn_failure_threshold {
            let last_failure = sandbox.last_spawn_failure.unwrap_or(0);
            let elapsed = now - last_failure;
            if elapsed < self.config.spawn_breaker_open_ms {
                let wait_s = (self.config.spawn_breaker_open_ms - elapsed) / 1000;
                self.registry
                    .broadcast(
                        BroadcastMode::AllClients,
                        &server_frames::sandbox_error(&format!(
                            "Sandbox provisioning is temporarily disabled after repeated failures. Retry in {wait_s}s."
                        )),
                        &self.repo,
                    )
                    .await;
                return Ok(());
            }
            self.repo.reset_spawn_breaker().await?;
        }

        // In-memory guard: one spawn attempt per actor at a time.
        if self
            .spawning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.spawn_with_flag_held(trigger, now).await;
        self.spawning.store(false, Ordering::SeqCst);
        result
    }

    async fn spawn_with_flag_held(
        self: &Arc<Self>,
        trigger: SpawnTrigger,
        now: i64,
    ) -> AppResult<()> {
        let Some(sandbox) = self.repo.get_sandbox().await? else {
            return Ok(());
        };

        let action = decide_spawn_action(&sandbox, now, self.sandbox_provider.supports_restore());
        info!(
            session_id = %self.session_id,
            ?trigger,
            ?action,
            status = %sandbox.status,
            "Sandbox spawn decision"
        );

        match action {
            SpawnAction::Skip | SpawnAction::Wait => Ok(()),
            SpawnAction::Restore => self.execute_provision(&sandbox, trigger, true).await,
            SpawnAction::Spawn => self.execute_provision(&sandbox, trigger, false).await,
        }
    }

    // ========================================================================
    // Spawn / restore execution
    // ========================================================================

    async fn execute_provision(
        self: &Arc<Self>,
        sandbox: &Sandbox,
        trigger: SpawnTrigger,
        restore: bool,
    ) -> AppResult<()> {
        if trigger == SpawnTrigger::Warm {
            self.registry
                .broadcast(
                    BroadcastMode::AllClients,
                    &server_frames::sandbox_warming(),
                    &self.repo,
                )
                .await;
        }

        let session = self.require_session().await?;
        let (auth_token, auth_token_hash) = generate_token();
        let expected_sandbox_id = expected_sandbox_id(&session.repo_owner, &session.repo_name);

        {
            let _guard = self.write_guard.lock().await;
            self.repo
                .begin_spawn(&expected_sandbox_id, &auth_token_hash)
                .await?;
        }
        self.broadcast_sandbox_status(SandboxStatus::Spawning).await;

        let env = merged_secrets(
            self.environment.as_ref(),
            &session.repo_owner,
            &session.repo_name,
        )
        .await;
        let repo_image = self
            .environment
            .repo_image(&session.repo_owner, &session.repo_name)
            .await;

        let config = SandboxConfig {
            session_id: self.session_id.clone(),
            expected_sandbox_id,
            auth_token,
            repo_owner: session.repo_owner.clone(),
            repo_name: session.repo_name.clone(),
            base_branch: session.base_branch.clone(),
            model: session.model.clone(),
            reasoning_effort: session.reasoning_effort.clone(),
            env,
            repo_image,
            snapshot_image_id: restore.then(|| sandbox.snapshot_image_id.clone()).flatten(),
        };

        let outcome = if restore {
            self.sandbox_provider.restore_from_snapshot(&config).await
        } else {
            self.sandbox_provider.create(&config).await
        };

        let _guard = self.write_guard.lock().await;
        match outcome {
            Ok(handle) => {
                self.repo
                    .set_provider_object(&handle.provider_object_id)
                    .await?;
                self.repo.reset_spawn_breaker().await?;
                drop(_guard);

                self.broadcast_sandbox_status(SandboxStatus::Connecting).await;
                if restore {
                    self.registry
                        .broadcast(
                            BroadcastMode::AllClients,
                            &server_frames::sandbox_restored("Resuming from snapshot"),
                            &self.repo,
                        )
                        .await;
                }
                info!(
                    session_id = %self.session_id,
                    provider_object_id = %handle.provider_object_id,
                    restore,
                    "Sandbox provisioning started"
                );
                Ok(())
            }
            Err(e) => {
                self.repo.record_spawn_error(&e.message).await?;
                // Restores never count toward the breaker: the snapshot may
                // simply be gone, which says nothing about provisioning.
                if !restore && e.counts_toward_breaker() {
                    self.repo.increment_spawn_failure().await?;
                }
                drop(_guard);

                self.broadcast_sandbox_status(SandboxStatus::Failed).await;
                self.registry
                    .broadcast(
                        BroadcastMode::AllClients,
                        &server_frames::sandbox_error(&e.message),
                        &self.repo,
                    )
                    .await;
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    kind = ?e.kind,
                    restore,
                    "Sandbox provisioning failed"
                );
                Ok(())
            }
        }
    }

    /// Called by the sandbox WS handler once the socket is accepted.
    pub async fn on_sandbox_connected(self: &Arc<Self>) -> AppResult<()> {
        {
            let _guard = self.write_guard.lock().await;
            self.repo.update_sandbox_status(SandboxStatus::Ready).await?;
            self.repo.set_last_activity(now_ms()).await?;
        }
        self.inactivity_warned.store(false, Ordering::SeqCst);

        self.broadcast_sandbox_status(SandboxStatus::Ready).await;
        self.schedule_alarm_at(now_ms() + self.config.inactivity_timeout_ms);
        self.dispatch().await
    }

    // ========================================================================
    // Alarm handler
    // ========================================================================

    /// One alarm fires at a time; each firing runs every watchdog in order
    /// and schedules its own follow-up.
    pub async fn handle_alarm(self: &Arc<Self>) {
        if let Err(e) = self.run_alarm_checks().await {
            error!(
                session_id = %self.session_id,
                error = %e,
                "Alarm handler failed"
            );
        }
    }

    async fn run_alarm_checks(self: &Arc<Self>) -> AppResult<()> {
        let now = now_ms();

        // 1. Execution timeout: enforced even when the sandbox is silent.
        {
            let _guard = self.write_guard.lock().await;
            if let Some(processing) = self.repo.get_processing_message_with_started_at().await? {
                let started = processing.started_at.unwrap_or(processing.created_at);
                if now - started >= self.config.execution_timeout_ms {
                    warn!(
                        session_id = %self.session_id,
                        message_id = %processing.id,
                        "Execution exceeded its time budget; failing it"
                    );
                    self.fail_stuck_processing_message_locked().await?;
                }
            }
        }

        // 2. Terminal sandboxes have nothing left to watch.
        let Some(sandbox) = self.repo.get_sandbox().await? else {
            return Ok(());
        };
        if sandbox.status.is_terminal() {
            return Ok(());
        }

        // 3. Heartbeat staleness.
        if let Some(last_heartbeat) = sandbox.last_heartbeat {
            if now - last_heartbeat >= self.config.heartbeat_timeout_ms {
                return self.handle_heartbeat_stale().await;
            }
        }

        // 4. Inactivity.
        let last_activity = sandbox.last_activity.unwrap_or(sandbox.created_at);
        let deadline = last_activity + self.config.inactivity_timeout_ms;
        let clients = self.registry.connected_client_count().await;

        if now >= deadline && clients == 0 {
            self.handle_inactivity_timeout().await
        } else if now >= deadline {
            // Clients are watching; keep the sandbox and check again later.
            self.schedule_alarm_at(now + self.config.inactivity_timeout_ms);
            Ok(())
        } else {
            if clients == 0
                && deadline - now <= INACTIVITY_WARNING_MS
                && !self.inactivity_warned.swap(true, Ordering::SeqCst)
            {
                self.registry
                    .broadcast(
                        BroadcastMode::AllClients,
                        &server_frames::sandbox_warning(
                            "Sandbox will stop soon due to inactivity",
                        ),
                        &self.repo,
                    )
                    .await;
            }
            self.schedule_alarm_at(deadline);
            Ok(())
        }
    }

    /// The sandbox stopped heartbeating: mark it stale, snapshot what we can
    /// in the background (the connection is likely already dead, so the
    /// snapshot is not awaited), and cut the socket.
    async fn handle_heartbeat_stale(self: &Arc<Self>) -> AppResult<()> {
        warn!(session_id = %self.session_id, "Sandbox heartbeat is stale");

        {
            let _guard = self.write_guard.lock().await;
            self.fail_stuck_processing_message_locked().await?;
            self.repo.update_sandbox_status(SandboxStatus::Stale).await?;
        }

        let actor = self.clone();
        tokio::spawn(async move {
            actor.trigger_snapshot("heartbeat_timeout").await;
        });

        self.broadcast_sandbox_status(SandboxStatus::Stale).await;
        self.registry
            .send_to_sandbox(&sandbox_commands::shutdown())
            .await;
        self.registry.close_sandbox(1000, "Heartbeat timeout").await;
        Ok(())
    }

    /// Idle with no clients: stop the sandbox. Status flips to `stopped`
    /// before the snapshot so a late reconnect is already rejected.
    async fn handle_inactivity_timeout(self: &Arc<Self>) -> AppResult<()> {
        info!(session_id = %self.session_id, "Stopping sandbox after inactivity");

        {
            let _guard = self.write_guard.lock().await;
            self.fail_stuck_processing_message_locked().await?;
            self.repo
                .update_sandbox_status(SandboxStatus::Stopped)
                .await?;
        }
        self.broadcast_sandbox_status(SandboxStatus::Stopped).await;

        self.trigger_snapshot("inactivity_timeout").await;

        self.registry
            .send_to_sandbox(&sandbox_commands::shutdown())
            .await;
        self.registry.close_sandbox(1000, "Inactivity timeout").await;
        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::sandbox_warning("Sandbox stopped after inactivity"),
                &self.repo,
            )
            .await;
        Ok(())
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Persist a filesystem image of the sandbox. No-op without a provider
    /// object or when a snapshot is already running. The pre-snapshot status
    /// is restored afterwards unless a heartbeat-timeout caller owns the
    /// final state.
    pub async fn trigger_snapshot(self: &Arc<Self>, reason: &str) {
        let result = self.try_snapshot(reason).await;
        if let Err(e) = result {
            warn!(
                session_id = %self.session_id,
                reason,
                error = %e,
                "Snapshot bookkeeping failed"
            );
        }
    }

    async fn try_snapshot(self: &Arc<Self>, reason: &str) -> AppResult<()> {
        let Some(sandbox) = self.repo.get_sandbox().await? else {
            return Ok(());
        };
        let Some(provider_object_id) = sandbox.provider_object_id.clone() else {
            return Ok(());
        };
        if sandbox.status == SandboxStatus::Snapshotting {
            return Ok(());
        }
        let previous_status = sandbox.status;

        {
            let _guard = self.write_guard.lock().await;
            self.repo
                .update_sandbox_status(SandboxStatus::Snapshotting)
                .await?;
        }
        self.broadcast_sandbox_status(SandboxStatus::Snapshotting).await;

        let outcome = self
            .sandbox_provider
            .take_snapshot(&provider_object_id, reason)
            .await;

        {
            let _guard = self.write_guard.lock().await;
            match &outcome {
                Ok(image_id) => {
                    self.repo.set_snapshot_image(image_id).await?;
                }
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        reason,
                        error = %e,
                        "Snapshot failed"
                    );
                }
            }
            if reason != "heartbeat_timeout" {
                self.repo.update_sandbox_status(previous_status).await?;
            }
        }

        if let Ok(image_id) = &outcome {
            self.registry
                .broadcast(
                    BroadcastMode::AllClients,
                    &server_frames::snapshot_saved(image_id, reason),
                    &self.repo,
                )
                .await;
            info!(
                session_id = %self.session_id,
                image_id = %image_id,
                reason,
                "Snapshot saved"
            );
        }
        if reason != "heartbeat_timeout" {
            self.broadcast_sandbox_status(previous_status).await;
        }
        Ok(())
    }

    // ========================================================================
    // Shared broadcast helper
    // ========================================================================

    pub(crate) async fn broadcast_sandbox_status(&self, status: SandboxStatus) {
        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::sandbox_status(&status.to_string()),
                &self.repo,
            )
            .await;
    }

    /// Activity bump shared by dispatch and event ingest: reset the idle
    /// window and clear the pending warning.
    pub(crate) async fn mark_activity(&self) -> AppResult<()> {
        self.repo.set_last_activity(now_ms()).await?;
        self.inactivity_warned.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic sandbox identity for this spawn attempt; the connecting
/// sandbox must present it on upgrade.
fn expected_sandbox_id(repo_owner: &str, repo_name: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!(
        "sbx-{}-{}-{}",
        sanitize(repo_owner),
        sanitize(repo_name),
        now_ms()
    )
}
