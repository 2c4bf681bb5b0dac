use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, AppError, AppResult};
use crate::events::{Event, EventType};
use crate::models::User;
use crate::state::AppState;

/// OpenSSH-style fingerprint (`SHA256:<base64>`) over the decoded key blob.
pub fn key_fingerprint(public_key: &str) -> AppResult<String> {
    let blob = public_key
        .split_whitespace()
        .nth(1)
        .or_else(|| public_key.split_whitespace().next())
        .ok_or_else(|| AppError::Validation("empty ssh public key".into()))?;
    let decoded = STANDARD
        .decode(blob)
        .map_err(|_| AppError::Validation("ssh public key is not valid base64".into()))?;
    let digest = Sha256::digest(&decoded);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub github_username: Option<String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

async fn build_user(payload: RegisterUserRequest) -> AppResult<User> {
    let github_username = payload
        .github_username
        .filter(|u| !u.trim().is_empty())
        .ok_or(AppError::MissingFields(vec!["github_username"]))?;
    let ssh_public_key = payload
        .ssh_public_key
        .filter(|k| !k.trim().is_empty())
        .map(|k| k.trim().to_string());
    let ssh_key_fingerprint = match &ssh_public_key {
        Some(key) => Some(key_fingerprint(key)?),
        None => None,
    };
    let now = Utc::now();
    Ok(User {
        user_id: Uuid::new_v4().to_string(),
        github_username,
        ssh_public_key,
        ssh_key_fingerprint,
        created_at: now,
        updated_at: now,
    })
}

/// `POST /api/v1/users`
pub async fn register_user(
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = build_user(payload).await?;
    let user = state.registries.users.register(user).await?;
    state
        .broadcaster
        .publish(Event::new(EventType::UserRegistered, json!({ "user": user })));
    Ok((StatusCode::CREATED, Json(user)))
}

/// `POST /api/v1/users/register` — GitHub-bound registration used by the
/// workspace flow; errors carry the structured body.
pub async fn register_user_github(
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let user = build_user(payload).await.map_err(ApiError::from)?;
    let user = state
        .registries
        .users
        .register(user)
        .await
        .map_err(ApiError::from)?;
    state
        .broadcaster
        .publish(Event::new(EventType::UserRegistered, json!({ "user": user })));
    let github_connected = state
        .registries
        .installations
        .get_by_username(&user.github_username)
        .await
        .is_ok();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user_id": user.user_id,
            "github_username": user.github_username,
            "ssh_key_fingerprint": user.ssh_key_fingerprint,
            "github_connected": github_connected,
            "created_at": user.created_at,
        })),
    ))
}

/// `GET /api/v1/users`
pub async fn list_users(Extension(state): Extension<AppState>) -> AppResult<Json<Value>> {
    let users = state.registries.users.list().await?;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

/// `GET /api/v1/users/:username`
pub async fn get_user(
    Extension(state): Extension<AppState>,
    Path(username): Path<String>,
) -> AppResult<Json<User>> {
    Ok(Json(state.registries.users.get(&username).await?))
}

/// `DELETE /api/v1/users/:username`
pub async fn delete_user(
    Extension(state): Extension<AppState>,
    Path(username): Path<String>,
) -> AppResult<Json<Value>> {
    state.registries.users.delete(&username).await?;
    state.broadcaster.publish(Event::new(
        EventType::UserDeleted,
        json!({ "github_username": username }),
    ));
    Ok(Json(json!({ "status": "deleted", "github_username": username })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_openssh_format() {
        // ssh-keygen -lf on this key prints the same digest.
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMrZtVzRz1uN7PSS6nCFW45pJ3gebIiIWwoGc6A9AAAA test@host";
        let fingerprint = key_fingerprint(key).unwrap();
        assert!(fingerprint.starts_with("SHA256:"));
        assert!(!fingerprint.ends_with('='));
    }

    #[test]
    fn garbage_key_is_rejected() {
        assert!(key_fingerprint("ssh-ed25519 not!!base64").is_err());
        assert!(key_fingerprint("   ").is_err());
    }
}
