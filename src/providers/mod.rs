pub mod github;
pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// Error classification
// ============================================================================

/// How a provider failure should be treated by callers. The circuit breaker
/// counts `Permanent` and `Unknown` failures; `Transient` ones are retried on
/// the next trigger without opening the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Permanent,
    Transient,
    Unknown,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// HTTP status from the upstream, when one exists. Handlers pass it
    /// through to external callers unchanged.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Unknown,
            status: None,
            message: message.into(),
        }
    }

    /// Classify an upstream HTTP status. Client errors are misconfiguration
    /// and will not heal on retry; rate limits, timeouts, and server errors
    /// will.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 429 => ProviderErrorKind::Transient,
            500..=599 => ProviderErrorKind::Transient,
            400..=499 => ProviderErrorKind::Permanent,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Permanent | ProviderErrorKind::Unknown
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ProviderError::transient(e.to_string())
        } else {
            ProviderError::unknown(e.to_string())
        }
    }
}

// ============================================================================
// Sandbox provider
// ============================================================================

/// Everything the provider needs to boot (or restore) an execution sandbox
/// for one session.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub session_id: String,
    pub expected_sandbox_id: String,
    /// Plaintext connect token handed to the sandbox; only its hash is stored.
    pub auth_token: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub base_branch: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    /// Merged secrets (global overlaid with per-repo).
    pub env: HashMap<String, String>,
    /// Pre-built repo image, when one exists.
    pub repo_image: Option<String>,
    /// Snapshot to restore from; only set on restore calls.
    pub snapshot_image_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub provider_object_id: String,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle, ProviderError>;

    fn supports_restore(&self) -> bool {
        false
    }

    async fn restore_from_snapshot(
        &self,
        config: &SandboxConfig,
    ) -> Result<SandboxHandle, ProviderError>;

    /// Returns the new snapshot image id.
    async fn take_snapshot(
        &self,
        provider_object_id: &str,
        reason: &str,
    ) -> Result<String, ProviderError>;
}

// ============================================================================
// SCM provider
// ============================================================================

#[derive(Debug, Clone)]
pub struct PushCredentials {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct CreatedPr {
    pub number: i64,
    pub url: String,
    pub state: String,
}

#[async_trait]
pub trait ScmProvider: Send + Sync {
    /// App-level (installation) credentials for pushing a branch. Not tied to
    /// any participant.
    async fn app_push_credentials(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<PushCredentials, ProviderError>;

    async fn default_branch(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<String, ProviderError>;

    /// Create the PR on behalf of a user, using their OAuth access token.
    async fn create_pull_request(
        &self,
        repo_owner: &str,
        repo_name: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        user_token: &str,
    ) -> Result<CreatedPr, ProviderError>;
}

// ============================================================================
// Callback delivery
// ============================================================================

#[async_trait]
pub trait CallbackService: Send + Sync {
    async fn notify_tool_call(
        &self,
        callback_context: &serde_json::Value,
        tool_call: &serde_json::Value,
    ) -> Result<(), ProviderError>;

    async fn notify_execution_complete(
        &self,
        callback_context: &serde_json::Value,
        success: bool,
    ) -> Result<(), ProviderError>;
}

// ============================================================================
// Read-only environment stores
// ============================================================================

/// Global and per-repo secret storage plus repo-image lookup. The actor only
/// reads these; writes happen elsewhere.
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn global_secrets(&self) -> HashMap<String, String>;

    async fn repo_secrets(&self, repo_owner: &str, repo_name: &str) -> HashMap<String, String>;

    async fn repo_image(&self, repo_owner: &str, repo_name: &str) -> Option<String>;
}

/// Merge global and per-repo secrets; per-repo entries win.
pub async fn merged_secrets(
    store: &dyn EnvironmentStore,
    repo_owner: &str,
    repo_name: &str,
) -> HashMap<String, String> {
    let mut merged = store.global_secrets().await;
    merged.extend(store.repo_secrets(repo_owner, repo_name).await);
    merged
}

// ============================================================================
// Token crypto collaborator
// ============================================================================

/// Decrypts stored OAuth token ciphertext. The actor itself never handles key
/// material; it holds ciphertext and hands it to this collaborator.
pub trait TokenCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, ProviderError>;
}

/// Dev-mode passthrough used when no KMS-backed cipher is wired in.
pub struct PlaintextTokenCipher;

impl TokenCipher for PlaintextTokenCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, ProviderError> {
        Ok(ciphertext.to_owned())
    }
}

/// Empty store used when no secret backend is configured.
pub struct NullEnvironmentStore;

#[async_trait]
impl EnvironmentStore for NullEnvironmentStore {
    async fn global_secrets(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn repo_secrets(&self, _repo_owner: &str, _repo_name: &str) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn repo_image(&self, _repo_owner: &str, _repo_name: &str) -> Option<String> {
        None
    }
}
