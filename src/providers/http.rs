use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{
    CallbackService, ProviderError, SandboxConfig, SandboxHandle, SandboxProvider,
};

/// Sandbox provider speaking a small REST protocol against the configured
/// fleet controller: `POST /sandboxes`, `POST /sandboxes/restore`,
/// `POST /sandboxes/{id}/snapshot`.
pub struct HttpSandboxProvider {
    client: Client,
    base_url: String,
}

impl HttpSandboxProvider {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn spawn_body(config: &SandboxConfig) -> serde_json::Value {
        json!({
            "session_id": config.session_id,
            "sandbox_id": config.expected_sandbox_id,
            "auth_token": config.auth_token,
            "repo_owner": config.repo_owner,
            "repo_name": config.repo_name,
            "base_branch": config.base_branch,
            "model": config.model,
            "reasoning_effort": config.reasoning_effort,
            "env": config.env,
            "repo_image": config.repo_image,
            "snapshot_image_id": config.snapshot_image_id,
        })
    }

    async fn post_for_handle(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<SandboxHandle, ProviderError> {
        if self.base_url.is_empty() {
            return Err(ProviderError::permanent("No sandbox provider configured"));
        }

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "sandbox provider error".into());
            return Err(ProviderError::from_status(status, message));
        }

        let payload: serde_json::Value = response.json().await?;
        let id = payload["id"]
            .as_str()
            .ok_or_else(|| ProviderError::unknown("Provider response had no id"))?;
        Ok(SandboxHandle {
            provider_object_id: id.to_owned(),
        })
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle, ProviderError> {
        self.post_for_handle("/sandboxes", Self::spawn_body(config))
            .await
    }

    fn supports_restore(&self) -> bool {
        true
    }

    async fn restore_from_snapshot(
        &self,
        config: &SandboxConfig,
    ) -> Result<SandboxHandle, ProviderError> {
        self.post_for_handle("/sandboxes/restore", Self::spawn_body(config))
            .await
    }

    async fn take_snapshot(
        &self,
        provider_object_id: &str,
        reason: &str,
    ) -> Result<String, ProviderError> {
        if self.base_url.is_empty() {
            return Err(ProviderError::permanent("No sandbox provider configured"));
        }

        let response = self
            .client
            .post(format!(
                "{}/sandboxes/{}/snapshot",
                self.base_url, provider_object_id
            ))
            .json(&json!({ "reason": reason }))
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "snapshot failed".into());
            return Err(ProviderError::from_status(status, message));
        }

        let payload: serde_json::Value = response.json().await?;
        payload["image_id"]
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ProviderError::unknown("Snapshot response had no image_id"))
    }
}

/// Best-effort webhook delivery to downstream integration bots. Callers treat
/// every failure as non-fatal; this client only reports them.
pub struct HttpCallbackService {
    client: Client,
    base_url: String,
}

impl HttpCallbackService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), ProviderError> {
        if self.base_url.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_status(
                response.status().as_u16(),
                "callback delivery failed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CallbackService for HttpCallbackService {
    async fn notify_tool_call(
        &self,
        callback_context: &serde_json::Value,
        tool_call: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        self.post(
            "/callbacks/tool-call",
            json!({ "context": callback_context, "tool_call": tool_call }),
        )
        .await
    }

    async fn notify_execution_complete(
        &self,
        callback_context: &serde_json::Value,
        success: bool,
    ) -> Result<(), ProviderError> {
        self.post(
            "/callbacks/execution-complete",
            json!({ "context": callback_context, "success": success }),
        )
        .await
    }
}
