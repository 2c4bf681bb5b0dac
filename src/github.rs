use std::time::Duration;

use serde::Deserialize;
use url::form_urlencoded;

use crate::config;
use crate::error::{AppError, AppResult};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const REPO_INFO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAccount {
    pub id: i64,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub private: bool,
    pub owner: GitHubAccount,
    pub name: String,
    pub clone_url: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForkInfo {
    pub full_name: String,
    pub owner: GitHubAccount,
    pub name: String,
    pub clone_url: String,
    pub html_url: String,
}

/// The slice of the GitHub REST surface the coordination server consumes:
/// OAuth code exchange, repo metadata, fork creation, and public user keys.
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    web_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl GitHubClient {
    pub fn from_env() -> Self {
        let redirect_uri = std::env::var("GITHUB_REDIRECT_URI")
            .unwrap_or_else(|_| "http://localhost:8080/auth/github/callback".into());
        Self::new(
            "https://api.github.com",
            "https://github.com",
            config::GITHUB_CLIENT_ID.clone(),
            config::GITHUB_CLIENT_SECRET.clone(),
            redirect_uri,
        )
    }

    pub fn new(
        api_base: impl Into<String>,
        web_base: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent("nexus-coordination")
                .build()
                .unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            web_base: web_base.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// The browser-facing authorization URL for a previously stored CSRF
    /// state token.
    pub fn authorize_url(&self, state: &str) -> String {
        let redirect: String =
            form_urlencoded::byte_serialize(self.redirect_uri.as_bytes()).collect();
        format!(
            "{}/login/oauth/authorize?client_id={}&redirect_uri={}&state={}&scope=repo",
            self.web_base, self.client_id, redirect, state
        )
    }

    pub async fn exchange_code(&self, code: &str) -> AppResult<OAuthToken> {
        let response = self
            .http
            .post(format!("{}/login/oauth/access_token", self.web_base))
            .timeout(EXCHANGE_TIMEOUT)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
                "redirect_uri": self.redirect_uri,
            }))
            .send()
            .await
            .map_err(|e| AppError::Message(format!("token exchange failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Message(format!(
                "token exchange failed: HTTP {}",
                response.status()
            )));
        }
        let token: OAuthToken = response
            .json()
            .await
            .map_err(|e| AppError::Message(format!("token exchange failed: {e}")))?;
        if token.access_token.is_empty() {
            return Err(AppError::Message("token exchange returned no token".into()));
        }
        Ok(token)
    }

    pub async fn authenticated_user(&self, token: &str) -> AppResult<GitHubAccount> {
        let response = self
            .http
            .get(format!("{}/user", self.api_base))
            .timeout(EXCHANGE_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Message(format!("user lookup failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Message(format!(
                "user lookup failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::Message(format!("user lookup failed: {e}")))
    }

    pub async fn repo_info(&self, token: &str, owner: &str, repo: &str) -> AppResult<RepoInfo> {
        let response = self
            .http
            .get(format!("{}/repos/{owner}/{repo}", self.api_base))
            .timeout(REPO_INFO_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Message(format!("repo lookup failed: {e}")))?;
        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| AppError::Message(format!("repo lookup failed: {e}"))),
            reqwest::StatusCode::NOT_FOUND => Err(AppError::NotFound),
            status => Err(AppError::Message(format!("repo lookup failed: HTTP {status}"))),
        }
    }

    pub async fn create_fork(&self, token: &str, owner: &str, repo: &str) -> AppResult<ForkInfo> {
        let response = self
            .http
            .post(format!("{}/repos/{owner}/{repo}/forks", self.api_base))
            .timeout(REPO_INFO_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Message(format!("fork creation failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Message(format!(
                "fork creation failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::Message(format!("fork creation failed: {e}")))
    }

    /// Public SSH keys GitHub publishes for a user. Empty output means the
    /// user has no keys (or the fetch failed upstream); callers fail soft.
    pub async fn user_keys(&self, username: &str) -> AppResult<String> {
        let response = self
            .http
            .get(format!("{}/{username}.keys", self.web_base))
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::Message(format!("key fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Message(format!(
                "key fetch failed: HTTP {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| AppError::Message(format!("key fetch failed: {e}")))
    }
}
