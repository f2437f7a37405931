use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    event_types, now_ms, Artifact, ArtifactType, Event, EventCursor, Message, MessageStatus,
    MessageTimestamps, Participant, ParticipantRole, Sandbox, SandboxStatus, Session,
    SessionStatus, WsClientMapping,
};

/// Typed accessor over one session's embedded store.
///
/// The repository is pure over SQL: it never broadcasts, never schedules, and
/// surfaces every database error to the caller. Cheaply cloneable — the pool
/// is an `Arc` internally.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

/// Arguments for the idempotent session upsert run by `POST init`.
pub struct NewSession<'a> {
    pub id: &'a str,
    pub session_name: &'a str,
    pub repo_owner: &'a str,
    pub repo_name: &'a str,
    pub repo_id: Option<i64>,
    pub base_branch: &'a str,
    pub model: &'a str,
    pub reasoning_effort: Option<&'a str>,
}

pub struct NewMessage<'a> {
    pub author_id: &'a str,
    pub content: &'a str,
    pub source: crate::models::MessageSource,
    pub model: Option<&'a str>,
    pub reasoning_effort: Option<&'a str>,
    pub attachments_json: Option<&'a str>,
    pub callback_context_json: Option<&'a str>,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Idempotent: re-running init refreshes `updated_at` and leaves the rest
    /// of the row untouched.
    pub async fn upsert_session(&self, new: NewSession<'_>) -> AppResult<Session> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO session
                 (id, session_name, repo_owner, repo_name, repo_id, base_branch,
                  model, reasoning_effort, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'created', ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(new.id)
        .bind(new.session_name)
        .bind(new.repo_owner)
        .bind(new.repo_name)
        .bind(new.repo_id)
        .bind(new.base_branch)
        .bind(new.model)
        .bind(new.reasoning_effort)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_session()
            .await?
            .ok_or(crate::error::AppError::Internal)
    }

    pub async fn get_session(&self) -> AppResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM session LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    pub async fn update_session_status(&self, status: SessionStatus) -> AppResult<()> {
        sqlx::query("UPDATE session SET status = ?1, updated_at = ?2")
            .bind(status)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_title_if_unset(&self, title: &str) -> AppResult<()> {
        sqlx::query("UPDATE session SET title = ?1, updated_at = ?2 WHERE title IS NULL")
            .bind(title)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_branch_name(&self, branch: &str) -> AppResult<()> {
        sqlx::query("UPDATE session SET branch_name = ?1, updated_at = ?2")
            .bind(branch)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_current_sha(&self, sha: &str) -> AppResult<()> {
        sqlx::query("UPDATE session SET current_sha = ?1, updated_at = ?2")
            .bind(sha)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Sandbox
    // ========================================================================

    pub async fn ensure_sandbox(&self) -> AppResult<Sandbox> {
        sqlx::query(
            "INSERT INTO sandbox (id, status, created_at) VALUES (?1, 'pending', ?2)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind("sandbox")
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.get_sandbox()
            .await?
            .ok_or(crate::error::AppError::Internal)
    }

    pub async fn get_sandbox(&self) -> AppResult<Option<Sandbox>> {
        let sandbox = sqlx::query_as::<_, Sandbox>("SELECT * FROM sandbox LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(sandbox)
    }

    pub async fn update_sandbox_status(&self, status: SandboxStatus) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET status = ?1")
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition into `spawning`: store the new token hash and the expected
    /// sandbox id, stamp `created_at`, and clear the previous spawn error.
    pub async fn begin_spawn(
        &self,
        expected_sandbox_id: &str,
        auth_token_hash: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE sandbox SET
                 status = 'spawning',
                 provider_sandbox_id = ?1,
                 auth_token_hash = ?2,
                 auth_token = NULL,
                 last_spawn_error = NULL,
                 last_spawn_error_at = NULL,
                 created_at = ?3",
        )
        .bind(expected_sandbox_id)
        .bind(auth_token_hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_provider_object(&self, provider_object_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET provider_object_id = ?1, status = 'connecting'")
            .bind(provider_object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_spawn_error(&self, error: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE sandbox SET status = 'failed', last_spawn_error = ?1, last_spawn_error_at = ?2",
        )
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failure toward the circuit breaker. Only permanent or unknown
    /// provider errors go through here; transient ones do not.
    pub async fn increment_spawn_failure(&self) -> AppResult<()> {
        sqlx::query(
            "UPDATE sandbox SET
                 spawn_failure_count = spawn_failure_count + 1,
                 last_spawn_failure = ?1",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_spawn_breaker(&self) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET spawn_failure_count = 0, last_spawn_failure = NULL")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_heartbeat(&self, ts: i64) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET last_heartbeat = ?1")
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_activity(&self, ts: i64) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET last_activity = ?1")
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_git_sync_status(&self, status: &str) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET git_sync_status = ?1")
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_snapshot_image(&self, image_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE sandbox SET snapshot_image_id = ?1")
            .bind(image_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Participants
    // ========================================================================

    pub async fn get_participant(&self, id: &str) -> AppResult<Option<Participant>> {
        let p = sqlx::query_as::<_, Participant>("SELECT * FROM participants WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(p)
    }

    pub async fn get_participant_by_user_id(&self, user_id: &str) -> AppResult<Option<Participant>> {
        let p = sqlx::query_as::<_, Participant>("SELECT * FROM participants WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(p)
    }

    /// Find or create the participant row for a user. At most one row per
    /// `user_id`; the insert is raced-safe via the unique constraint.
    pub async fn ensure_participant(
        &self,
        user_id: &str,
        role: ParticipantRole,
    ) -> AppResult<Participant> {
        if let Some(existing) = self.get_participant_by_user_id(user_id).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO participants (id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(&id)
        .bind(user_id)
        .bind(role)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.get_participant_by_user_id(user_id)
            .await?
            .ok_or(crate::error::AppError::Internal)
    }

    pub async fn list_participants(&self) -> AppResult<Vec<Participant>> {
        let rows =
            sqlx::query_as::<_, Participant>("SELECT * FROM participants ORDER BY joined_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn update_participant_scm(
        &self,
        participant_id: &str,
        scm_user_id: Option<&str>,
        scm_login: Option<&str>,
        scm_name: Option<&str>,
        scm_email: Option<&str>,
        access_token_encrypted: Option<&str>,
        refresh_token_encrypted: Option<&str>,
        token_expires_at: Option<i64>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE participants SET
                 scm_user_id = COALESCE(?2, scm_user_id),
                 scm_login = COALESCE(?3, scm_login),
                 scm_name = COALESCE(?4, scm_name),
                 scm_email = COALESCE(?5, scm_email),
                 scm_access_token_encrypted = COALESCE(?6, scm_access_token_encrypted),
                 scm_refresh_token_encrypted = COALESCE(?7, scm_refresh_token_encrypted),
                 scm_token_expires_at = COALESCE(?8, scm_token_expires_at)
             WHERE id = ?1",
        )
        .bind(participant_id)
        .bind(scm_user_id)
        .bind(scm_login)
        .bind(scm_name)
        .bind(scm_email)
        .bind(access_token_encrypted)
        .bind(refresh_token_encrypted)
        .bind(token_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ws_token_hash(&self, participant_id: &str, hash: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE participants SET ws_auth_token_hash = ?2, ws_token_created_at = ?3 WHERE id = ?1",
        )
        .bind(participant_id)
        .bind(hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_participant_by_ws_token_hash(
        &self,
        hash: &str,
    ) -> AppResult<Option<Participant>> {
        let p = sqlx::query_as::<_, Participant>(
            "SELECT * FROM participants WHERE ws_auth_token_hash = ?1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(p)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub async fn insert_message(&self, new: NewMessage<'_>) -> AppResult<Message> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO messages
                 (id, author_id, content, source, model, reasoning_effort,
                  attachments_json, callback_context_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
        )
        .bind(&id)
        .bind(new.author_id)
        .bind(new.content)
        .bind(new.source)
        .bind(new.model)
        .bind(new.reasoning_effort)
        .bind(new.attachments_json)
        .bind(new.callback_context_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_message(&id)
            .await?
            .ok_or(crate::error::AppError::Internal)
    }

    pub async fn get_message(&self, id: &str) -> AppResult<Option<Message>> {
        let m = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(m)
    }

    pub async fn list_messages(&self) -> AppResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Strict FIFO: oldest pending first, id as the tiebreaker.
    pub async fn get_next_pending_message(&self) -> AppResult<Option<Message>> {
        let m = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(m)
    }

    pub async fn get_processing_message(&self) -> AppResult<Option<Message>> {
        let m = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE status = 'processing' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(m)
    }

    /// Processing message that has actually been dispatched. The execution
    /// watchdog keys off `started_at`; a row without it cannot be stuck.
    pub async fn get_processing_message_with_started_at(&self) -> AppResult<Option<Message>> {
        let m = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages
             WHERE status = 'processing' AND started_at IS NOT NULL LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(m)
    }

    pub async fn get_pending_or_processing_count(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Claim a pending message for dispatch. Returns `false` when the row was
    /// no longer pending — the caller must not dispatch it twice.
    pub async fn update_message_to_processing(&self, id: &str, started_at: i64) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'processing', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal transition. Guarded on `processing` so a stop that already
    /// failed the message wins over a late completion.
    pub async fn update_message_completion(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .bind(status)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_message_timestamps(&self, id: &str) -> AppResult<Option<MessageTimestamps>> {
        let t = sqlx::query_as::<_, MessageTimestamps>(
            "SELECT created_at, started_at, completed_at FROM messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(t)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub async fn insert_event(
        &self,
        event_type: &str,
        data_json: &str,
        message_id: Option<&str>,
    ) -> AppResult<Event> {
        let id = Uuid::new_v4().to_string();
        self.put_event(&id, event_type, data_json, message_id).await
    }

    /// Upsert keyed by deterministic id — each message has one canonical token
    /// event and one canonical execution_complete event; the latest write wins.
    pub async fn upsert_token_event(&self, message_id: &str, data_json: &str) -> AppResult<Event> {
        let id = format!("{}:{}", event_types::TOKEN, message_id);
        self.put_event(&id, event_types::TOKEN, data_json, Some(message_id))
            .await
    }

    pub async fn upsert_execution_complete_event(
        &self,
        message_id: &str,
        data_json: &str,
    ) -> AppResult<Event> {
        let id = format!("{}:{}", event_types::EXECUTION_COMPLETE, message_id);
        self.put_event(
            &id,
            event_types::EXECUTION_COMPLETE,
            data_json,
            Some(message_id),
        )
        .await
    }

    async fn put_event(
        &self,
        id: &str,
        event_type: &str,
        data_json: &str,
        message_id: Option<&str>,
    ) -> AppResult<Event> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO events (id, event_type, data_json, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 data_json = excluded.data_json,
                 created_at = excluded.created_at",
        )
        .bind(id)
        .bind(event_type)
        .bind(data_json)
        .bind(message_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(event)
    }

    /// Newest `limit` non-heartbeat events, returned in chronological order
    /// for replay delivery.
    pub async fn get_events_for_replay(&self, limit: i64) -> AppResult<Vec<Event>> {
        let mut rows = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE event_type != 'heartbeat'
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// One page older than the cursor, plus a limit+1 probe for `has_more`.
    /// Items come back in chronological order; the caller's next cursor is the
    /// oldest item of the page.
    pub async fn get_events_history_page(
        &self,
        cursor: &EventCursor,
        limit: i64,
    ) -> AppResult<(Vec<Event>, bool)> {
        let mut rows = sqlx::query_as::<_, Event>(
            "SELECT * FROM events
             WHERE event_type != 'heartbeat'
               AND (created_at < ?1 OR (created_at = ?1 AND id < ?2))
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )
        .bind(cursor.timestamp)
        .bind(&cursor.id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        rows.reverse();
        Ok((rows, has_more))
    }

    pub async fn count_events(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Artifacts
    // ========================================================================

    pub async fn insert_artifact(
        &self,
        artifact_type: ArtifactType,
        url: Option<&str>,
        metadata_json: Option<&str>,
    ) -> AppResult<Artifact> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO artifacts (id, artifact_type, url, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(artifact_type)
        .bind(url)
        .bind(metadata_json)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = ?1")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(artifact)
    }

    pub async fn list_artifacts(&self) -> AppResult<Vec<Artifact>> {
        let rows =
            sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn get_pr_artifact(&self) -> AppResult<Option<Artifact>> {
        let a = sqlx::query_as::<_, Artifact>(
            "SELECT * FROM artifacts WHERE artifact_type = 'pr' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(a)
    }

    // ========================================================================
    // WebSocket client mappings
    // ========================================================================

    pub async fn persist_ws_mapping(
        &self,
        ws_id: &str,
        participant_id: &str,
        client_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO ws_client_mappings (ws_id, participant_id, client_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(ws_id) DO UPDATE SET
                 participant_id = excluded.participant_id,
                 client_id = excluded.client_id",
        )
        .bind(ws_id)
        .bind(participant_id)
        .bind(client_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_ws_mapping(&self, ws_id: &str) -> AppResult<Option<WsClientMapping>> {
        let m = sqlx::query_as::<_, WsClientMapping>(
            "SELECT * FROM ws_client_mappings WHERE ws_id = ?1",
        )
        .bind(ws_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(m)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
