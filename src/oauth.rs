use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Extension, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use url::form_urlencoded;

use crate::error::{AppError, AppResult};
use crate::events::{Event, EventType};
use crate::models::{GitHubInstallation, User};
use crate::state::AppState;

const STATE_TTL: Duration = Duration::from_secs(600);

struct StateEntry {
    repo_full_name: String,
    created: Instant,
}

/// Process-local CSRF state store. Validation consumes tokens; stale
/// entries are purged on every insert.
pub struct StateStore {
    entries: Mutex<HashMap<String, StateEntry>>,
    ttl: Duration,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: STATE_TTL,
        }
    }
}

impl StateStore {
    pub fn generate(&self, repo_full_name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let state = format!("state_{nanos}_{repo_full_name}");
        let mut entries = self.entries.lock().expect("state store poisoned");
        entries.retain(|_, entry| entry.created.elapsed() < self.ttl);
        entries.insert(
            state.clone(),
            StateEntry {
                repo_full_name: repo_full_name.to_string(),
                created: Instant::now(),
            },
        );
        state
    }

    /// Consume a state token, returning the repo it was issued for.
    pub fn validate(&self, state: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("state store poisoned");
        let entry = entries.remove(state)?;
        if entry.created.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.repo_full_name)
    }
}

#[derive(Deserialize)]
pub struct OAuthUrlRequest {
    pub repo_full_name: String,
}

/// `POST /api/github/oauth-url`
pub async fn oauth_url(
    Extension(state): Extension<AppState>,
    Json(payload): Json<OAuthUrlRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.repo_full_name.trim().is_empty() {
        return Err(AppError::MissingFields(vec!["repo_full_name"]));
    }
    let csrf = state.oauth_states.generate(&payload.repo_full_name);
    let auth_url = state.github.authorize_url(&csrf);
    Ok(Json(json!({ "auth_url": auth_url, "state": csrf })))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn error_redirect(error: &str) -> Response {
    let encoded: String = form_urlencoded::byte_serialize(error.as_bytes()).collect();
    Redirect::to(&format!("/workspace/auth-error?error={encoded}")).into_response()
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json"))
        .unwrap_or(false)
}

/// `GET|POST /auth/github/callback` — the browser lands here after GitHub
/// authorization.
pub async fn callback(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error.as_deref().filter(|e| !e.is_empty()) {
        return error_redirect(error);
    }
    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return error_redirect("missing_code");
    };

    let repo_full_name = match params
        .state
        .as_deref()
        .and_then(|s| state.oauth_states.validate(s))
    {
        Some(repo) => repo,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "status": "state_validation_failed" })),
            )
                .into_response();
        }
    };

    let token = match state.github.exchange_code(code).await {
        Ok(token) => token,
        Err(err) => {
            tracing::error!(?err, "github code exchange failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "status": "exchange_failed" })),
            )
                .into_response();
        }
    };

    let account = match state.github.authenticated_user(&token.access_token).await {
        Ok(account) => account,
        Err(err) => {
            tracing::error!(?err, "github user lookup failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "status": "exchange_failed" })),
            )
                .into_response();
        }
    };

    // Resolve (or auto-create) the coordination user for this GitHub login.
    let user_id = match state.registries.users.get(&account.login).await {
        Ok(user) => user.user_id,
        Err(AppError::NotFound) => {
            let now = Utc::now();
            let user = User {
                user_id: account.login.clone(),
                github_username: account.login.clone(),
                ssh_public_key: None,
                ssh_key_fingerprint: None,
                created_at: now,
                updated_at: now,
            };
            match state.registries.users.register(user).await {
                Ok(created) => {
                    state.broadcaster.publish(Event::new(
                        EventType::UserRegistered,
                        json!({ "user": created }),
                    ));
                    created.user_id
                }
                Err(err) => {
                    tracing::error!(?err, "auto-creating user failed");
                    return err.into_response();
                }
            }
        }
        Err(err) => return err.into_response(),
    };

    let installation = GitHubInstallation {
        installation_id: 0,
        user_id: user_id.clone(),
        github_user_id: account.id,
        github_username: account.login.clone(),
        repo_full_name: Some(repo_full_name),
        token: token.access_token,
        token_expires_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    if installation.user_id.is_empty()
        || installation.github_user_id == 0
        || installation.github_username.is_empty()
        || installation.token.is_empty()
    {
        return AppError::Validation("incomplete installation record".into()).into_response();
    }
    if let Err(err) = state.registries.installations.store(installation).await {
        return err.into_response();
    }

    if wants_json(&headers) {
        return Json(json!({ "success": true, "status": "authorized" })).into_response();
    }
    let user_param: String = form_urlencoded::byte_serialize(account.login.as_bytes()).collect();
    Redirect::to(&format!("/workspace/auth-success?user={user_param}")).into_response()
}

/// `GET /api/github/token` — token record lookup by the `X-User-ID` header.
pub async fn token_lookup(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<GitHubInstallation>> {
    let user_id = headers
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation("X-User-ID header is required".into()))?;
    let installation = state.registries.installations.get(user_id).await?;
    Ok(Json(installation))
}

pub async fn auth_success_page() -> Html<&'static str> {
    Html(
        "<html><body><h1>GitHub authorization complete</h1>\
         <p>You can close this tab and return to your terminal.</p></body></html>",
    )
}

pub async fn auth_error_page(Query(params): Query<HashMap<String, String>>) -> Html<String> {
    let error = params
        .get("error")
        .map(String::as_str)
        .unwrap_or("unknown_error");
    Html(format!(
        "<html><body><h1>GitHub authorization failed</h1><p>{error}</p></body></html>"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tokens_embed_repo_and_validate_once() {
        let store = StateStore::default();
        let state = store.generate("owner/repo");
        assert!(state.starts_with("state_"));
        assert!(state.ends_with("_owner/repo"));
        assert_eq!(store.validate(&state).as_deref(), Some("owner/repo"));
        // Consumed on first validation.
        assert!(store.validate(&state).is_none());
    }

    #[test]
    fn unknown_state_fails_validation() {
        let store = StateStore::default();
        assert!(store.validate("state_0_owner/repo").is_none());
    }
}
