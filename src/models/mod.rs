use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Current wall-clock time as epoch milliseconds — the unit every persisted
/// timestamp in the session store uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Status enums
// ============================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Completed,
    Archived,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Spawning,
    Connecting,
    Warming,
    Syncing,
    Ready,
    Running,
    Stale,
    Snapshotting,
    Stopped,
    Failed,
}

impl SandboxStatus {
    /// Terminal states never transition out on their own; a new spawn or
    /// restore is required.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Stale | Self::Failed)
    }

    /// Once a sandbox is stopped or stale, late reconnect attempts from the
    /// old sandbox must be refused with 410.
    pub fn rejects_sandbox_sockets(self) -> bool {
        matches!(self, Self::Stopped | Self::Stale)
    }

    /// States in which a spawn request should be skipped or deferred rather
    /// than starting another sandbox.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Running | Self::Warming | Self::Syncing | Self::Snapshotting
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Spawning | Self::Connecting)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageSource {
    Web,
    Slack,
    Linear,
    Extension,
    Github,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactType {
    Pr,
    Branch,
}

// ============================================================================
// Event type names
// ============================================================================

/// Sandbox event type strings. Stored as plain TEXT so unrecognized types a
/// newer sandbox emits can be persisted verbatim and replayed.
pub mod event_types {
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const TOKEN: &str = "token";
    pub const ERROR: &str = "error";
    pub const GIT_SYNC: &str = "git_sync";
    pub const STEP_START: &str = "step_start";
    pub const STEP_FINISH: &str = "step_finish";
    pub const EXECUTION_COMPLETE: &str = "execution_complete";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PUSH_COMPLETE: &str = "push_complete";
    pub const PUSH_ERROR: &str = "push_error";
    pub const USER_MESSAGE: &str = "user_message";

    /// Events that carry an `ack_id` must be acknowledged back to the sandbox
    /// so it can stop re-delivering them.
    pub fn is_critical(event_type: &str) -> bool {
        matches!(
            event_type,
            EXECUTION_COMPLETE | PUSH_COMPLETE | PUSH_ERROR | ERROR
        )
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    pub id: String,
    pub session_name: String,
    pub title: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_id: Option<i64>,
    pub base_branch: String,
    pub branch_name: Option<String>,
    pub base_sha: Option<String>,
    pub current_sha: Option<String>,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Sandbox
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Sandbox {
    pub id: String,
    pub provider_sandbox_id: Option<String>,
    pub provider_object_id: Option<String>,
    pub snapshot_image_id: Option<String>,
    /// Legacy plaintext token column. Never written by new code; retained so
    /// rows created before hashing keep verifying.
    pub auth_token: Option<String>,
    pub auth_token_hash: Option<String>,
    pub status: SandboxStatus,
    pub git_sync_status: String,
    pub last_heartbeat: Option<i64>,
    pub last_activity: Option<i64>,
    pub last_spawn_error: Option<String>,
    pub last_spawn_error_at: Option<i64>,
    pub spawn_failure_count: i64,
    pub last_spawn_failure: Option<i64>,
    pub created_at: i64,
}

/// Client-facing view of the sandbox row. Token material is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxDto {
    pub id: String,
    pub provider_sandbox_id: Option<String>,
    pub snapshot_image_id: Option<String>,
    pub status: SandboxStatus,
    pub git_sync_status: String,
    pub last_heartbeat: Option<i64>,
    pub last_activity: Option<i64>,
    pub last_spawn_error: Option<String>,
    pub created_at: i64,
}

impl From<Sandbox> for SandboxDto {
    fn from(s: Sandbox) -> Self {
        SandboxDto {
            id: s.id,
            provider_sandbox_id: s.provider_sandbox_id,
            snapshot_image_id: s.snapshot_image_id,
            status: s.status,
            git_sync_status: s.git_sync_status,
            last_heartbeat: s.last_heartbeat,
            last_activity: s.last_activity,
            last_spawn_error: s.last_spawn_error,
            created_at: s.created_at,
        }
    }
}

// ============================================================================
// Participant
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub scm_user_id: Option<String>,
    pub scm_login: Option<String>,
    pub scm_name: Option<String>,
    pub scm_email: Option<String>,
    pub scm_access_token_encrypted: Option<String>,
    pub scm_refresh_token_encrypted: Option<String>,
    pub scm_token_expires_at: Option<i64>,
    pub ws_auth_token_hash: Option<String>,
    pub ws_token_created_at: Option<i64>,
    pub role: ParticipantRole,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantDto {
    pub id: String,
    pub user_id: String,
    pub scm_login: Option<String>,
    pub scm_name: Option<String>,
    pub role: ParticipantRole,
    pub joined_at: i64,
}

impl From<Participant> for ParticipantDto {
    fn from(p: Participant) -> Self {
        ParticipantDto {
            id: p.id,
            user_id: p.user_id,
            scm_login: p.scm_login,
            scm_name: p.scm_name,
            role: p.role,
            joined_at: p.joined_at,
        }
    }
}

// ============================================================================
// Message (the prompt queue)
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub source: MessageSource,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub attachments_json: Option<String>,
    pub callback_context_json: Option<String>,
    pub status: MessageStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Timestamp triple used to compute queue/processing/total durations when a
/// prompt finishes.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct MessageTimestamps {
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

// ============================================================================
// Event (append-only activity log)
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub data_json: String,
    pub message_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDto {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub message_id: Option<String>,
    pub created_at: i64,
}

impl Event {
    /// Parse the stored payload for delivery. Returns `None` when the stored
    /// JSON is malformed; replay skips such rows rather than aborting.
    pub fn into_dto(self) -> Option<EventDto> {
        let data = serde_json::from_str(&self.data_json).ok()?;
        Some(EventDto {
            id: self.id,
            event_type: self.event_type,
            data,
            message_id: self.message_id,
            created_at: self.created_at,
        })
    }
}

// ============================================================================
// Artifact
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Artifact {
    pub id: String,
    pub artifact_type: ArtifactType,
    pub url: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDto {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub url: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: i64,
}

impl From<Artifact> for ArtifactDto {
    fn from(a: Artifact) -> Self {
        let metadata = a
            .metadata_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok());
        ArtifactDto {
            id: a.id,
            artifact_type: a.artifact_type,
            url: a.url,
            metadata,
            created_at: a.created_at,
        }
    }
}

// ============================================================================
// WebSocket client mapping
// ============================================================================

/// Durable record tying a client socket id to a participant. Lets a restarted
/// process re-identify sockets that were accepted before the restart.
#[derive(Debug, Clone, FromRow)]
pub struct WsClientMapping {
    pub ws_id: String,
    pub participant_id: String,
    pub client_id: String,
    pub created_at: i64,
}

// ============================================================================
// Cursors
// ============================================================================

/// Composite history cursor: `(created_at, id)` gives a stable total order
/// even when two events share a timestamp. Event ids are strings (UUIDs or
/// deterministic `type:message` keys), compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: i64,
    pub id: String,
}
