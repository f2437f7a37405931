use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{CreatedPr, ProviderError, PushCredentials, ScmProvider};

/// GitHub REST implementation of the SCM seam.
///
/// App-level concerns (JWT minting, installation-token caching) live in the
/// edge; this client receives a ready installation token and performs plain
/// REST calls with it.
pub struct GithubScmProvider {
    client: Client,
    api_url: String,
    app_token: String,
}

impl GithubScmProvider {
    pub fn new(client: Client, api_url: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            app_token: app_token.into(),
        }
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["message"].as_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| format!("GitHub request failed with status {status}"));
        ProviderError::from_status(status, message)
    }
}

#[async_trait]
impl ScmProvider for GithubScmProvider {
    async fn app_push_credentials(
        &self,
        _repo_owner: &str,
        _repo_name: &str,
    ) -> Result<PushCredentials, ProviderError> {
        if self.app_token.is_empty() {
            return Err(ProviderError::permanent("No GitHub app token configured"));
        }
        // Installation tokens authenticate pushes as the app's bot user.
        Ok(PushCredentials {
            username: "x-access-token".into(),
            token: self.app_token.clone(),
        })
    }

    async fn default_branch(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/repos/{}/{}", self.api_url, repo_owner, repo_name);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.app_token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "tandem-server")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: serde_json::Value = response.json().await?;
        body["default_branch"]
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ProviderError::unknown("Repository response had no default_branch"))
    }

    async fn create_pull_request(
        &self,
        repo_owner: &str,
        repo_name: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        user_token: &str,
    ) -> Result<CreatedPr, ProviderError> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_url, repo_owner, repo_name);
        let response = self
            .client
            .post(&url)
            .bearer_auth(user_token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "tandem-server")
            .json(&json!({
                "title": title,
                "body": body,
                "head": head_branch,
                "base": base_branch,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let pr: serde_json::Value = response.json().await?;
        let number = pr["number"]
            .as_i64()
            .ok_or_else(|| ProviderError::unknown("PR response had no number"))?;
        let html_url = pr["html_url"]
            .as_str()
            .ok_or_else(|| ProviderError::unknown("PR response had no html_url"))?;

        Ok(CreatedPr {
            number,
            url: html_url.to_owned(),
            state: pr["state"].as_str().unwrap_or("open").to_owned(),
        })
    }
}
