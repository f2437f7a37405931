// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tandem_server::config::Config;
use tandem_server::db;
use tandem_server::models::ParticipantRole;
use tandem_server::providers::{
    CallbackService, CreatedPr, EnvironmentStore, PlaintextTokenCipher, ProviderError,
    PushCredentials, SandboxConfig, SandboxHandle, SandboxProvider, ScmProvider,
};
use tandem_server::repository::Repository;
use tandem_server::session::{ActorDeps, InitRequest, SessionActor};
use tandem_server::websocket::{ClientInfo, Outbound, SocketSender};

// ============================================================================
// Scripted sandbox provider
// ============================================================================

/// What the next provider call should do.
pub enum Scripted {
    Ok,
    Permanent(&'static str),
    Transient(&'static str),
}

/// Sandbox provider with a scripted result queue; defaults to success once
/// the queue is drained.
pub struct ScriptedSandboxProvider {
    script: Mutex<VecDeque<Scripted>>,
    pub create_calls: AtomicUsize,
    pub restore_calls: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
    pub restore_supported: bool,
}

impl ScriptedSandboxProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            create_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
            restore_supported: true,
        })
    }

    pub fn push_result(&self, result: Scripted) {
        self.script.lock().unwrap().push_back(result);
    }

    fn next_result(&self) -> Result<SandboxHandle, ProviderError> {
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            None | Some(Scripted::Ok) => Ok(SandboxHandle {
                provider_object_id: format!(
                    "obj-{}",
                    self.create_calls.load(Ordering::SeqCst)
                ),
            }),
            Some(Scripted::Permanent(msg)) => Err(ProviderError::permanent(msg)),
            Some(Scripted::Transient(msg)) => Err(ProviderError::transient(msg)),
        }
    }
}

#[async_trait]
impl SandboxProvider for ScriptedSandboxProvider {
    async fn create(&self, _config: &SandboxConfig) -> Result<SandboxHandle, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.next_result()
    }

    fn supports_restore(&self) -> bool {
        self.restore_supported
    }

    async fn restore_from_snapshot(
        &self,
        _config: &SandboxConfig,
    ) -> Result<SandboxHandle, ProviderError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.next_result()
    }

    async fn take_snapshot(
        &self,
        _provider_object_id: &str,
        _reason: &str,
    ) -> Result<String, ProviderError> {
        let n = self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("img-{}", n + 1))
    }
}

// ============================================================================
// Mock SCM
// ============================================================================

pub struct MockScmProvider {
    pub pr_calls: AtomicUsize,
    pub fail_pr_with_status: Option<u16>,
}

impl MockScmProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pr_calls: AtomicUsize::new(0),
            fail_pr_with_status: None,
        })
    }
}

#[async_trait]
impl ScmProvider for MockScmProvider {
    async fn app_push_credentials(
        &self,
        _repo_owner: &str,
        _repo_name: &str,
    ) -> Result<PushCredentials, ProviderError> {
        Ok(PushCredentials {
            username: "x-access-token".into(),
            token: "ghs_test".into(),
        })
    }

    async fn default_branch(
        &self,
        _repo_owner: &str,
        _repo_name: &str,
    ) -> Result<String, ProviderError> {
        Ok("main".into())
    }

    async fn create_pull_request(
        &self,
        repo_owner: &str,
        repo_name: &str,
        _head_branch: &str,
        _base_branch: &str,
        _title: &str,
        _body: &str,
        _user_token: &str,
    ) -> Result<CreatedPr, ProviderError> {
        let n = self.pr_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_pr_with_status {
            return Err(ProviderError::from_status(status, "scm rejected"));
        }
        Ok(CreatedPr {
            number: (n + 1) as i64,
            url: format!("https://github.com/{repo_owner}/{repo_name}/pull/{}", n + 1),
            state: "open".into(),
        })
    }
}

// ============================================================================
// Recording callback service
// ============================================================================

#[derive(Default)]
pub struct RecordingCallbackService {
    pub tool_calls: AtomicUsize,
    pub completions: AtomicUsize,
}

#[async_trait]
impl CallbackService for RecordingCallbackService {
    async fn notify_tool_call(&self, _ctx: &Value, _tool: &Value) -> Result<(), ProviderError> {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn notify_execution_complete(
        &self,
        _ctx: &Value,
        _success: bool,
    ) -> Result<(), ProviderError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct EmptyEnvironment;

#[async_trait]
impl EnvironmentStore for EmptyEnvironment {
    async fn global_secrets(&self) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::new()
    }

    async fn repo_secrets(
        &self,
        _repo_owner: &str,
        _repo_name: &str,
    ) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::new()
    }

    async fn repo_image(&self, _repo_owner: &str, _repo_name: &str) -> Option<String> {
        None
    }
}

// ============================================================================
// Actor harness
// ============================================================================

pub struct Harness {
    pub actor: Arc<SessionActor>,
    pub sandbox_provider: Arc<ScriptedSandboxProvider>,
    pub scm: Arc<MockScmProvider>,
    pub callbacks: Arc<RecordingCallbackService>,
}

/// Actor over an in-memory store with scripted collaborators and the short
/// test timing windows from `Config::for_tests`.
pub async fn build_harness() -> Harness {
    build_harness_with(Config::for_tests()).await
}

pub async fn build_harness_with(config: Config) -> Harness {
    let pool = db::create_memory_pool().await.expect("memory pool");
    db::run_migrations(&pool).await.expect("migrations");

    let sandbox_provider = ScriptedSandboxProvider::new();
    let scm = MockScmProvider::new();
    let callbacks = Arc::new(RecordingCallbackService::default());

    let deps = ActorDeps {
        config: Arc::new(config),
        sandbox_provider: sandbox_provider.clone(),
        scm: scm.clone(),
        environment: Arc::new(EmptyEnvironment),
        callback_service: callbacks.clone(),
        token_cipher: Arc::new(PlaintextTokenCipher),
    };

    let actor = SessionActor::new("sess-test-1".into(), Repository::new(pool), deps);
    Harness {
        actor,
        sandbox_provider,
        scm,
        callbacks,
    }
}

pub fn init_request() -> InitRequest {
    serde_json::from_value(serde_json::json!({
        "session_name": "fix-login-bug",
        "repo_owner": "acme",
        "repo_name": "web-app",
        "repo_id": 42,
        "base_branch": "main",
        "user_id": "u-owner",
    }))
    .expect("init request shape")
}

impl Harness {
    /// Run init and wait for the background warm spawn to settle.
    pub async fn init_session(&self) {
        self.actor.init(init_request()).await.expect("init");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    /// Attach a channel-backed sandbox socket and run the connect
    /// bookkeeping. Returns the receiver for frames sent to the sandbox.
    pub async fn connect_sandbox(&self) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.actor.registry.accept_sandbox("sbx-test", tx).await;
        self.actor
            .on_sandbox_connected()
            .await
            .expect("sandbox connect");
        rx
    }

    /// Attach an authenticated channel-backed client socket.
    pub async fn connect_client(&self, ws_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.actor.registry.accept_client(ws_id, tx).await;
        let participant = self
            .actor
            .repo
            .ensure_participant("u-owner", ParticipantRole::Owner)
            .await
            .expect("participant");
        self.actor
            .registry
            .set_client(
                ws_id,
                ClientInfo {
                    participant_id: participant.id,
                    client_id: format!("client-{ws_id}"),
                },
            )
            .await;
        rx
    }

    pub async fn enqueue(&self, content: &str) -> tandem_server::models::Message {
        self.actor
            .enqueue_prompt(tandem_server::session::queue::PromptRequest {
                user_id: "u-owner".into(),
                content: content.into(),
                source: tandem_server::models::MessageSource::Web,
                model: None,
                reasoning_effort: None,
                attachments: None,
                callback_context: None,
                request_id: None,
                origin_ws_id: None,
            })
            .await
            .expect("enqueue")
    }

    pub async fn send_sandbox_event(&self, event: Value) {
        let event = tandem_server::websocket::protocol::SandboxEvent::from_value(event)
            .expect("event shape");
        self.actor
            .process_sandbox_event(event)
            .await
            .expect("event ingest");
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

/// Drain every frame currently queued on a socket receiver.
pub fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Text(text) = outbound {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
    }
    frames
}

pub fn frames_of_type<'a>(frames: &'a [Value], frame_type: &str) -> Vec<&'a Value> {
    frames
        .iter()
        .filter(|f| f["type"] == frame_type)
        .collect()
}

/// Await the next frame with a deadline, skipping non-text traffic.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
    loop {
        let outbound = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed");
        if let Outbound::Text(text) = outbound {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

/// Dummy sender for tests that only need a live channel.
pub fn socket_pair() -> (SocketSender, mpsc::UnboundedReceiver<Outbound>) {
    mpsc::unbounded_channel()
}

// ============================================================================
// HTTP test app
// ============================================================================

use axum::routing::{get, post};
use axum::Router;
use tandem_server::handlers;
use tandem_server::session::SessionRegistry;
use tandem_server::state::AppState;

/// App state over a throwaway data directory with scripted collaborators.
pub fn test_app_state(test_name: &str) -> AppState {
    let mut config = Config::for_tests();
    config.data_dir = std::env::temp_dir()
        .join("tandem_http_tests")
        .join(format!("{test_name}-{}", uuid::Uuid::new_v4()));

    let config = Arc::new(config);
    let deps = ActorDeps {
        config: config.clone(),
        sandbox_provider: ScriptedSandboxProvider::new(),
        scm: MockScmProvider::new(),
        environment: Arc::new(EmptyEnvironment),
        callback_service: Arc::new(RecordingCallbackService::default()),
        token_cipher: Arc::new(PlaintextTokenCipher),
    };

    AppState {
        config,
        sessions: Arc::new(SessionRegistry::new(deps)),
    }
}

/// The application router wired to test state; mirrors the production
/// routes minus the loopback-guarded metrics endpoint.
pub fn create_test_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sessions/:session_id/init", post(handlers::init_session))
        .route("/sessions/:session_id/state", get(handlers::get_state))
        .route("/sessions/:session_id/prompt", post(handlers::post_prompt))
        .route("/sessions/:session_id/stop", post(handlers::post_stop))
        .route(
            "/sessions/:session_id/sandbox-event",
            post(handlers::post_sandbox_event),
        )
        .route(
            "/sessions/:session_id/participants",
            get(handlers::list_participants).post(handlers::join_participant),
        )
        .route("/sessions/:session_id/events", get(handlers::list_events))
        .route(
            "/sessions/:session_id/artifacts",
            get(handlers::list_artifacts),
        )
        .route(
            "/sessions/:session_id/messages",
            get(handlers::list_messages),
        )
        .route("/sessions/:session_id/create-pr", post(handlers::create_pr))
        .route(
            "/sessions/:session_id/ws-token",
            post(handlers::rotate_ws_token),
        )
        .route(
            "/sessions/:session_id/archive",
            post(handlers::archive_session),
        )
        .route(
            "/sessions/:session_id/unarchive",
            post(handlers::unarchive_session),
        )
        .route(
            "/sessions/:session_id/verify-sandbox-token",
            post(handlers::verify_sandbox_token),
        )
        .route(
            "/sessions/:session_id/openai-token-refresh",
            post(handlers::openai_token_refresh),
        )
        .with_state(state)
}
