use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::ArtifactType;
use crate::providers::ProviderError;
use crate::websocket::protocol::server_frames;
use crate::websocket::registry::BroadcastMode;

use super::SessionActor;

static BRANCH_SANITIZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9/_-]+").expect("static branch regex"));

#[derive(Debug, Default, Deserialize)]
pub struct CreatePrRequest {
    pub user_id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub base_branch: Option<String>,
    pub head_branch: Option<String>,
}

/// Outcome of `POST create-pr`: either a created PR or the manual fallback
/// when the prompting participant has no usable OAuth credentials.
#[derive(Debug)]
pub enum PrOutcome {
    Created {
        pr_number: i64,
        pr_url: String,
        state: String,
    },
    Manual {
        create_pr_url: String,
        head_branch: String,
        base_branch: String,
    },
}

impl PrOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            PrOutcome::Created {
                pr_number,
                pr_url,
                state,
            } => json!({
                "pr_number": pr_number,
                "pr_url": pr_url,
                "state": state,
            }),
            PrOutcome::Manual {
                create_pr_url,
                head_branch,
                base_branch,
            } => json!({
                "status": "manual",
                "create_pr_url": create_pr_url,
                "head_branch": head_branch,
                "base_branch": base_branch,
            }),
        }
    }
}

fn upstream(e: ProviderError) -> AppError {
    AppError::Upstream {
        status: e.status.unwrap_or(502),
        message: e.message,
    }
}

impl SessionActor {
    /// Turn "create a PR for this session" into exactly one PR artifact, or a
    /// manual-fallback branch artifact when user OAuth is unavailable.
    pub async fn create_pull_request(&self, req: CreatePrRequest) -> AppResult<PrOutcome> {
        let session = self.require_active_session().await?;

        {
            let _guard = self.write_guard.lock().await;
            if self.repo.get_pr_artifact().await?.is_some() {
                return Err(AppError::Conflict(
                    "A pull request already exists for this session".into(),
                ));
            }
        }

        // App-level credentials: the push is performed as the app, not the
        // requesting user.
        let credentials = self
            .scm
            .app_push_credentials(&session.repo_owner, &session.repo_name)
            .await
            .map_err(upstream)?;

        let base_branch = match req.base_branch.clone() {
            Some(base) if !base.is_empty() => base,
            _ if !session.base_branch.is_empty() => session.base_branch.clone(),
            _ => self
                .scm
                .default_branch(&session.repo_owner, &session.repo_name)
                .await
                .map_err(upstream)?,
        };

        let head_branch = req
            .head_branch
            .clone()
            .or_else(|| session.branch_name.clone())
            .unwrap_or_else(|| generated_branch_name(&session.session_name, &self.session_id));

        let push_spec = json!({
            "branch": head_branch,
            "base_branch": base_branch,
            "remote_url": format!(
                "https://github.com/{}/{}.git",
                session.repo_owner, session.repo_name
            ),
            "username": credentials.username,
            "token": credentials.token,
        });

        let pushed = self.push_branch_to_remote(&head_branch, push_spec).await;
        if !pushed.success {
            return Err(AppError::Upstream {
                status: 502,
                message: pushed
                    .error
                    .unwrap_or_else(|| "Branch push failed".into()),
            });
        }

        {
            let _guard = self.write_guard.lock().await;
            self.repo.set_branch_name(&head_branch).await?;

            // Another create-pr may have landed during the push window.
            if self.repo.get_pr_artifact().await?.is_some() {
                return Err(AppError::Conflict(
                    "A pull request already exists for this session".into(),
                ));
            }
        }

        let participant = self.repo.get_participant_by_user_id(&req.user_id).await?;
        let user_token = participant
            .as_ref()
            .and_then(|p| p.scm_access_token_encrypted.as_deref())
            .map(|ciphertext| self.token_cipher.decrypt(ciphertext))
            .transpose()
            .map_err(upstream)?;

        match user_token {
            Some(token) => {
                self.create_pr_with_user_auth(&session, req, &base_branch, &head_branch, &token)
                    .await
            }
            None => self.manual_pr_fallback(&session, &base_branch, &head_branch).await,
        }
    }

    async fn create_pr_with_user_auth(
        &self,
        session: &crate::models::Session,
        req: CreatePrRequest,
        base_branch: &str,
        head_branch: &str,
        user_token: &str,
    ) -> AppResult<PrOutcome> {
        let title = req
            .title
            .or_else(|| session.title.clone())
            .unwrap_or_else(|| session.session_name.clone());
        let body = format!(
            "{}\n\n---\nCreated from a [Tandem session]({}/sessions/{}).",
            req.body.unwrap_or_default(),
            self.config.app_base_url,
            self.session_id,
        );

        let pr = self
            .scm
            .create_pull_request(
                &session.repo_owner,
                &session.repo_name,
                head_branch,
                base_branch,
                &title,
                &body,
                user_token,
            )
            .await
            .map_err(upstream)?;

        let artifact = {
            let _guard = self.write_guard.lock().await;
            let metadata = json!({
                "number": pr.number,
                "state": pr.state,
                "head_branch": head_branch,
                "base_branch": base_branch,
            });
            // The partial unique index backstops the re-check above: a racing
            // insert surfaces as 409, not as a second PR row.
            self.repo
                .insert_artifact(ArtifactType::Pr, Some(&pr.url), Some(&metadata.to_string()))
                .await?
        };

        let dto = crate::models::ArtifactDto::from(artifact);
        self.registry
            .broadcast(
                BroadcastMode::AllClients,
                &server_frames::artifact_created(&serde_json::to_value(&dto).unwrap_or_default()),
                &self.repo,
            )
            .await;

        info!(
            session_id = %self.session_id,
            pr_number = pr.number,
            "Pull request created"
        );
        Ok(PrOutcome::Created {
            pr_number: pr.number,
            pr_url: pr.url,
            state: pr.state,
        })
    }

    /// No user OAuth: hand back a compare URL and record the pushed branch so
    /// the UI can keep offering it.
    async fn manual_pr_fallback(
        &self,
        session: &crate::models::Session,
        base_branch: &str,
        head_branch: &str,
    ) -> AppResult<PrOutcome> {
        let create_pr_url = format!(
            "https://github.com/{}/{}/compare/{}...{}?quick_pull=1",
            session.repo_owner, session.repo_name, base_branch, head_branch
        );

        let _guard = self.write_guard.lock().await;
        let existing = self
            .repo
            .list_artifacts()
            .await?
            .into_iter()
            .find(|a| {
                a.artifact_type == ArtifactType::Branch
                    && a.metadata_json
                        .as_deref()
                        .and_then(|j| serde_json::from_str::<Value>(j).ok())
                        .map(|m| m["head_branch"] == head_branch)
                        .unwrap_or(false)
            });

        if existing.is_none() {
            let metadata = json!({
                "mode": "manual_pr",
                "head_branch": head_branch,
                "base_branch": base_branch,
            });
            let branch_url = format!(
                "https://github.com/{}/{}/tree/{}",
                session.repo_owner, session.repo_name, head_branch
            );
            let artifact = self
                .repo
                .insert_artifact(
                    ArtifactType::Branch,
                    Some(&branch_url),
                    Some(&metadata.to_string()),
                )
                .await?;

            let dto = crate::models::ArtifactDto::from(artifact);
            self.registry
                .broadcast(
                    BroadcastMode::AllClients,
                    &server_frames::artifact_created(
                        &serde_json::to_value(&dto).unwrap_or_default(),
                    ),
                    &self.repo,
                )
                .await;
        }

        Ok(PrOutcome::Manual {
            create_pr_url,
            head_branch: head_branch.to_owned(),
            base_branch: base_branch.to_owned(),
        })
    }
}

/// Branch generated from the session when neither the request nor the session
/// names one.
fn generated_branch_name(session_name: &str, session_id: &str) -> String {
    let short_id: String = session_id.chars().take(8).collect();
    let raw = format!("tandem/{session_name}-{short_id}");
    BRANCH_SANITIZER
        .replace_all(&raw, "-")
        .trim_matches('-')
        .to_owned()
}
