pub mod callback;
pub mod events;
pub mod lifecycle;
pub mod presence;
pub mod pull_request;
pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::info;

use crate::alarm::AlarmSlot;
use crate::config::Config;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{
    now_ms, ParticipantRole, SandboxDto, Session, SessionStatus,
};
use crate::providers::{
    CallbackService, EnvironmentStore, SandboxProvider, ScmProvider, TokenCipher,
};
use crate::repository::{NewSession, Repository};
use crate::websocket::protocol::{sandbox_commands, server_frames};
use crate::websocket::registry::{BroadcastMode, WebSocketRegistry};

use callback::CallbackBridge;
use events::PushOutcome;
use queue::DEFAULT_MODEL;

// ============================================================================
// Actor
// ============================================================================

/// The per-session actor: single owner of one session's store, sockets, and
/// watchdogs.
///
/// Serialization: `write_guard` wraps every compound read-modify-write against
/// the store. Provider calls, push waits, and snapshots run outside the guard
/// and re-acquire it for their transitions, so long suspensions never block
/// event ingest.
pub struct SessionActor {
    pub session_id: String,
    pub config: Arc<Config>,
    pub repo: Repository,
    pub registry: WebSocketRegistry,

    pub(crate) sandbox_provider: Arc<dyn SandboxProvider>,
    pub(crate) scm: Arc<dyn ScmProvider>,
    pub(crate) environment: Arc<dyn EnvironmentStore>,
    pub(crate) callbacks: CallbackBridge,
    pub(crate) token_cipher: Arc<dyn TokenCipher>,

    pub(crate) write_guard: Mutex<()>,
    pub(crate) alarm: AlarmSlot,
    /// A spawn is in flight this tick; cleared unconditionally when it ends.
    pub(crate) spawning: AtomicBool,
    /// The 5-minute inactivity warning has been sent for the current idle span.
    pub(crate) inactivity_warned: AtomicBool,
    /// Pending push rendezvous, keyed by normalized branch name.
    pub(crate) push_waiters: StdMutex<HashMap<String, oneshot::Sender<PushOutcome>>>,
    /// Per-client history fetch throttling: ws id → last request time.
    pub(crate) history_limits: StdMutex<HashMap<String, i64>>,
}

/// Everything an actor needs besides its own store; shared across sessions.
#[derive(Clone)]
pub struct ActorDeps {
    pub config: Arc<Config>,
    pub sandbox_provider: Arc<dyn SandboxProvider>,
    pub scm: Arc<dyn ScmProvider>,
    pub environment: Arc<dyn EnvironmentStore>,
    pub callback_service: Arc<dyn CallbackService>,
    pub token_cipher: Arc<dyn TokenCipher>,
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub session_name: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_id: Option<i64>,
    pub base_branch: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    /// External id of the user creating the session; becomes the owner
    /// participant.
    pub user_id: String,
}

impl SessionActor {
    pub fn new(session_id: String, repo: Repository, deps: ActorDeps) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            config: deps.config,
            repo,
            registry: WebSocketRegistry::new(),
            sandbox_provider: deps.sandbox_provider,
            scm: deps.scm,
            environment: deps.environment,
            callbacks: CallbackBridge::new(deps.callback_service),
            token_cipher: deps.token_cipher,
            write_guard: Mutex::new(()),
            alarm: AlarmSlot::new(),
            spawning: AtomicBool::new(false),
            inactivity_warned: AtomicBool::new(false),
            push_waiters: StdMutex::new(HashMap::new()),
            history_limits: StdMutex::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Init / state
    // ========================================================================

    /// Idempotent session bootstrap: session row, sandbox row, owner
    /// participant, then a background warm spawn.
    pub async fn init(self: &Arc<Self>, req: InitRequest) -> AppResult<Value> {
        {
            let _guard = self.write_guard.lock().await;
            self.repo
                .upsert_session(NewSession {
                    id: &self.session_id,
                    session_name: &req.session_name,
                    repo_owner: &req.repo_owner,
                    repo_name: &req.repo_name,
                    repo_id: req.repo_id,
                    base_branch: req.base_branch.as_deref().unwrap_or("main"),
                    model: req.model.as_deref().unwrap_or(DEFAULT_MODEL),
                    reasoning_effort: req.reasoning_effort.as_deref(),
                })
                .await?;
            self.repo.ensure_sandbox().await?;
            self.repo
                .ensure_participant(&req.user_id, ParticipantRole::Owner)
                .await?;
        }

        info!(session_id = %self.session_id, "Session initialized");

        let actor = self.clone();
        tokio::spawn(async move {
            actor.ensure_sandbox_spawned(lifecycle::SpawnTrigger::Warm).await;
        });

        Ok(json!({ "session_id": self.session_id, "status": "created" }))
    }

    pub async fn state(&self) -> AppResult<Value> {
        let session = self.require_session().await?;
        let sandbox = self.repo.get_sandbox().await?.map(SandboxDto::from);
        Ok(json!({ "session": session, "sandbox": sandbox }))
    }

    pub(crate) async fn require_session(&self) -> AppResult<Session> {
        self.repo
            .get_session()
            .await?
            .ok_or_else(|| AppError::NotFound("Session not initialized".into()))
    }

    /// Write paths that need a live session refuse archived ones.
    pub(crate) async fn require_active_session(&self) -> AppResult<Session> {
        let session = self.require_session().await?;
        if session.status == SessionStatus::Archived {
            return Err(AppError::Forbidden("Session is archived".into()));
        }
        Ok(session)
    }

    // ========================================================================
    // Archive / unarchive
    // ========================================================================

    pub async fn archive(&self, user_id: &str) -> AppResult<()> {
        self.set_archived(user_id, true).await
    }

    pub async fn unarchive(&self, user_id: &str) -> AppResult<()> {
        self.set_archived(user_id, false).await
    }

    async fn set_archived(&self, user_id: &str, archived: bool) -> AppResult<()> {
        let _guard = self.write_guard.lock().await;
        self.require_session().await?;

        // Only people already in the session may toggle its lifecycle.
        if self
            .repo
            .get_participant_by_user_id(user_id)
            .await?
            .is_none()
        {
            return Err(AppError::Forbidden(
                "Only session participants may archive".into(),
            ));
        }

        let status = if archived {
            SessionStatus::Archived
        } else {
            SessionStatus::Active
        };
        self.repo.update_session_status(status).await?;

        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::session_status(&status.to_string()),
                &self.repo,
            )
            .await;
        Ok(())
    }

    // ========================================================================
    // WS auth tokens
    // ========================================================================

    /// Rotate the participant's WS token: the plaintext goes back to the
    /// caller once; only the hash is stored.
    pub async fn rotate_ws_token(&self, user_id: &str) -> AppResult<Value> {
        let _guard = self.write_guard.lock().await;
        self.require_session().await?;

        let participant = self
            .repo
            .ensure_participant(user_id, ParticipantRole::Member)
            .await?;

        let (plaintext, hash) = generate_token();
        self.repo.set_ws_token_hash(&participant.id, &hash).await?;

        Ok(json!({
            "token": plaintext,
            "participant_id": participant.id,
            "expires_in_ms": self.config.ws_token_ttl_ms,
        }))
    }

    /// Resolve a subscribe token to its participant, enforcing the token TTL.
    pub async fn authenticate_ws_token(
        &self,
        token: &str,
    ) -> AppResult<crate::models::Participant> {
        let hash = sha256_hex(token);
        let participant = self
            .repo
            .get_participant_by_ws_token_hash(&hash)
            .await?
            .ok_or_else(|| AppError::Auth("Invalid token".into()))?;

        let created_at = participant
            .ws_token_created_at
            .ok_or_else(|| AppError::Auth("Invalid token".into()))?;
        if now_ms() - created_at > self.config.ws_token_ttl_ms {
            return Err(AppError::Auth("Token expired".into()));
        }
        Ok(participant)
    }

    // ========================================================================
    // Sandbox token verification
    // ========================================================================

    /// Constant-time verification of a sandbox connect token. Falls back to
    /// the legacy plaintext column for rows written before hashing.
    pub async fn verify_sandbox_token(&self, token: &str) -> AppResult<()> {
        let sandbox = self
            .repo
            .get_sandbox()
            .await?
            .ok_or_else(|| AppError::NotFound("Sandbox not initialized".into()))?;

        if sandbox.status.rejects_sandbox_sockets() {
            return Err(AppError::Gone("Sandbox is no longer available".into()));
        }

        let valid = match (&sandbox.auth_token_hash, &sandbox.auth_token) {
            (Some(hash), _) => constant_time_eq(&sha256_hex(token), hash),
            (None, Some(plaintext)) => constant_time_eq(token, plaintext),
            (None, None) => false,
        };

        if valid {
            Ok(())
        } else {
            Err(AppError::Auth("Invalid sandbox token".into()))
        }
    }

    // ========================================================================
    // Model-provider credential refresh
    // ========================================================================

    /// Forward a refreshed model-provider credential to the live sandbox.
    pub async fn refresh_provider_credential(&self, token: &str) -> AppResult<()> {
        self.require_active_session().await?;
        let delivered = self
            .registry
            .send_to_sandbox(&sandbox_commands::credential_refresh(token))
            .await;
        if delivered {
            Ok(())
        } else {
            Err(AppError::Upstream {
                status: 503,
                message: "No sandbox connected".into(),
            })
        }
    }

    // ========================================================================
    // Alarm plumbing
    // ========================================================================

    /// Deadline of the pending wake-up, when one is scheduled.
    pub fn next_alarm_deadline(&self) -> Option<i64> {
        self.alarm.current_deadline()
    }

    /// Earlier-wins alarm scheduling; the sleeper task dies quietly when a
    /// sooner deadline replaces it.
    pub(crate) fn schedule_alarm_at(self: &Arc<Self>, at_ms: i64) {
        let Some(generation) = self.alarm.propose(at_ms) else {
            return;
        };

        let actor = self.clone();
        tokio::spawn(async move {
            let delay = (at_ms - now_ms()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if actor.alarm.claim(generation) {
                actor.handle_alarm().await;
            }
        });
    }
}

// ============================================================================
// Token helpers
// ============================================================================

/// 256-bit random token; returns `(plaintext, sha256-hex hash)`.
pub(crate) fn generate_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = URL_SAFE_NO_PAD.encode(bytes);
    let hash = sha256_hex(&plaintext);
    (plaintext, hash)
}

pub(crate) fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ============================================================================
// Actor registry
// ============================================================================

/// Process-wide map of live actors. Each session's actor is created on first
/// touch and stays resident; all of its durable state lives in the store, so
/// eviction would only cost warm caches.
pub struct SessionRegistry {
    deps: ActorDeps,
    actors: RwLock<HashMap<String, Arc<SessionActor>>>,
}

impl SessionRegistry {
    pub fn new(deps: ActorDeps) -> Self {
        Self {
            deps,
            actors: RwLock::new(HashMap::new()),
        }
    }

    /// Actor for `POST init`: opens (creating if missing) the session store
    /// and runs migrations before anything else touches it.
    pub async fn get_or_init(&self, session_id: &str) -> AppResult<Arc<SessionActor>> {
        if let Some(actor) = self.actors.read().await.get(session_id) {
            return Ok(actor.clone());
        }

        let mut actors = self.actors.write().await;
        if let Some(actor) = actors.get(session_id) {
            return Ok(actor.clone());
        }

        tokio::fs::create_dir_all(&self.deps.config.data_dir)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create session data directory");
                AppError::Internal
            })?;

        let pool = db::create_session_pool(&self.deps.config.data_dir, session_id).await?;
        db::run_migrations(&pool).await?;

        let actor = SessionActor::new(
            session_id.to_owned(),
            Repository::new(pool),
            self.deps.clone(),
        );
        actors.insert(session_id.to_owned(), actor.clone());
        Ok(actor)
    }

    /// Actor for every other endpoint: refuses to materialize a store for a
    /// session that was never initialized.
    pub async fn get_existing(&self, session_id: &str) -> AppResult<Arc<SessionActor>> {
        if let Some(actor) = self.actors.read().await.get(session_id) {
            return Ok(actor.clone());
        }

        let file: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let path = self.deps.config.data_dir.join(format!("{file}.db"));
        if file.is_empty() || !path.exists() {
            return Err(AppError::NotFound("Session not found".into()));
        }

        self.get_or_init(session_id).await
    }

    /// Wire a pre-built actor in, for tests that construct stores directly.
    pub async fn insert(&self, actor: Arc<SessionActor>) {
        self.actors
            .write()
            .await
            .insert(actor.session_id.clone(), actor);
    }
}
