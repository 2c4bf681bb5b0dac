use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{ApiError, ApiResult, AppError};
use crate::models::{Workspace, WorkspaceStatus};
use crate::pipeline::{self, RequestedService};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct RepoSpec {
    pub owner: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_fork: bool,
}

#[derive(Deserialize)]
pub struct CreateFromRepoRequest {
    pub github_username: Option<String>,
    pub workspace_name: Option<String>,
    pub repo: Option<RepoSpec>,
    pub provider: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub services: Vec<RequestedService>,
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// `POST /api/v1/workspaces/create-from-repo`
///
/// Validates, resolves GitHub credentials, optionally auto-forks, persists
/// the workspace as `creating` and hands over to the background pipeline.
pub async fn create_from_repo(
    Extension(state): Extension<AppState>,
    Json(payload): Json<CreateFromRepoRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut missing = Vec::new();
    if payload.github_username.as_deref().unwrap_or("").is_empty() {
        missing.push("github_username");
    }
    if payload.workspace_name.as_deref().unwrap_or("").is_empty() {
        missing.push("workspace_name");
    }
    let repo = payload.repo.clone().unwrap_or(RepoSpec {
        owner: None,
        name: None,
        url: None,
        branch: None,
        is_fork: false,
    });
    if repo.owner.as_deref().unwrap_or("").is_empty() {
        missing.push("repo.owner");
    }
    if repo.name.as_deref().unwrap_or("").is_empty() {
        missing.push("repo.name");
    }
    if repo.url.as_deref().unwrap_or("").is_empty() {
        missing.push("repo.url");
    }
    if !missing.is_empty() {
        return Err(ApiError::missing_fields(&missing));
    }

    let github_username = payload.github_username.unwrap();
    let workspace_name = payload.workspace_name.unwrap();
    let mut repo_owner = repo.owner.unwrap();
    let mut repo_name = repo.name.unwrap();
    let mut repo_url = repo.url.unwrap();
    let branch = repo
        .branch
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "main".into());

    let user = match state.registries.users.get(&github_username).await {
        Ok(user) => user,
        Err(AppError::NotFound) => return Err(ApiError::user_not_found(&github_username)),
        Err(err) => return Err(err.into()),
    };

    let installation = match state.registries.installations.get(&user.user_id).await {
        Ok(installation) => Ok(installation),
        Err(AppError::NotFound) => state
            .registries
            .installations
            .get_by_username(&github_username)
            .await,
        Err(err) => Err(err),
    };
    let installation = match installation {
        Ok(installation) => installation,
        Err(AppError::NotFound) => {
            let csrf = state
                .oauth_states
                .generate(&format!("{repo_owner}/{repo_name}"));
            return Err(ApiError::github_auth_required(
                state.github.authorize_url(&csrf),
            ));
        }
        Err(err) => return Err(err.into()),
    };

    let nanos = unix_nanos();
    let workspace_id = format!("ws-{nanos}");
    let ssh_port = 2222 + (nanos % 100) as u16;

    // Auto-fork: a private repo the user does not own is forked so the
    // clone runs against something their token can push to. Failures here
    // downgrade to the original repo.
    let mut fork_created = false;
    let mut fork_url = None;
    if !repo.is_fork {
        match state
            .github
            .repo_info(&installation.token, &repo_owner, &repo_name)
            .await
        {
            Ok(info) if info.private && info.owner.login != github_username => {
                match state
                    .github
                    .create_fork(&installation.token, &repo_owner, &repo_name)
                    .await
                {
                    Ok(fork) => {
                        let record = crate::models::GitHubFork {
                            user_id: user.user_id.clone(),
                            original_owner: repo_owner.clone(),
                            original_repo: repo_name.clone(),
                            fork_owner: fork.owner.login.clone(),
                            fork_url: Some(fork.html_url.clone()),
                            created_at: Utc::now(),
                        };
                        if let Err(err) = state.registries.forks.store(record).await {
                            tracing::warn!(?err, "recording fork failed");
                        }
                        repo_owner = fork.owner.login;
                        repo_name = fork.name;
                        repo_url = fork.clone_url;
                        fork_created = true;
                        fork_url = Some(fork.html_url);
                    }
                    Err(err) => {
                        tracing::warn!(?err, "fork creation failed, using original repo");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(?err, "repo lookup failed, skipping fork decision");
            }
        }
    }

    let now = Utc::now();
    let workspace = Workspace {
        workspace_id: workspace_id.clone(),
        user_id: user.user_id.clone(),
        workspace_name,
        status: WorkspaceStatus::Creating,
        provider: payload.provider.filter(|p| !p.is_empty()).unwrap_or_else(|| "docker".into()),
        image: payload
            .image
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| "ubuntu:22.04".into()),
        repo_owner,
        repo_name,
        repo_url,
        branch,
        commit: None,
        is_fork: repo.is_fork || fork_created,
        fork_url: fork_url.clone(),
        ssh_host: None,
        ssh_port: Some(ssh_port),
        node_id: None,
        created_at: now,
        updated_at: now,
    };
    let workspace = state
        .registries
        .workspaces
        .create(workspace)
        .await
        .map_err(ApiError::from)?;

    pipeline::spawn(
        state.clone(),
        workspace.clone(),
        Some(installation.token),
        payload.services,
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "workspace_id": workspace_id,
            "status": "creating",
            "ssh_port": ssh_port,
            "polling_url": format!("/api/v1/workspaces/{workspace_id}/status"),
            "estimated_time_seconds": 60,
            "fork_created": fork_created,
            "fork_url": fork_url,
            "created_at": now,
        })),
    ))
}

/// `GET /api/v1/workspaces/:id/status`
pub async fn workspace_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace = match state.registries.workspaces.get(&id).await {
        Ok(workspace) => workspace,
        Err(AppError::NotFound) => {
            return Err(ApiError::not_found(format!("workspace {id} not found")))
        }
        Err(err) => return Err(err.into()),
    };
    let services = state
        .registries
        .workspaces
        .services(&id)
        .await
        .unwrap_or_default();

    let host = workspace.ssh_host.clone().unwrap_or_else(|| "localhost".into());
    let ssh_port = workspace.ssh_port.unwrap_or(2222);

    let mut service_map = Map::new();
    for service in services {
        let url_port = service.local_port.unwrap_or(service.port);
        service_map.insert(
            service.name.clone(),
            json!({
                "service_id": service.service_id,
                "status": service.status,
                "health_status": service.health_status,
                "port": service.port,
                "local_port": service.local_port,
                "url": format!("http://{host}:{url_port}"),
            }),
        );
    }

    Ok(Json(json!({
        "workspace_id": workspace.workspace_id,
        "workspace_name": workspace.workspace_name,
        "status": workspace.status,
        "provider": workspace.provider,
        "image": workspace.image,
        "repo": {
            "owner": workspace.repo_owner,
            "name": workspace.repo_name,
            "url": workspace.repo_url,
            "branch": workspace.branch,
        },
        "ssh": { "host": host, "port": ssh_port },
        "services": service_map,
        "node_id": workspace.node_id,
        "created_at": workspace.created_at,
        "updated_at": workspace.updated_at,
    })))
}

/// `POST /api/v1/workspaces/:id/stop`
///
/// Flips persistent state to `stopped`; container teardown belongs to the
/// provider wiring.
pub async fn stop_workspace(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .registries
        .workspaces
        .set_status(&id, WorkspaceStatus::Stopped)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "workspace_id": id, "status": "stopped" })))
}

/// `DELETE /api/v1/workspaces/:id` — hard removal; services go with the row.
pub async fn delete_workspace(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .registries
        .workspaces
        .delete(&id)
        .await
        .map_err(ApiError::from)?;
    let dir = state.workspace_root.join(&id);
    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(?err, workspace_id = %id, "workspace directory cleanup failed");
        }
    }
    Ok(Json(json!({ "workspace_id": id, "status": "deleted" })))
}

#[derive(Deserialize, Default)]
pub struct ListWorkspacesQuery {
    pub user: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /api/v1/workspaces`
pub async fn list_workspaces(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListWorkspacesQuery>,
) -> ApiResult<Json<Value>> {
    let workspaces = state
        .registries
        .workspaces
        .list(
            query.user.as_deref(),
            query.limit.unwrap_or(0),
            query.offset.unwrap_or(0),
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "count": workspaces.len(), "workspaces": workspaces })))
}

/// `GET /api/v1/workspaces/:id/users` — currently the owning user.
pub async fn workspace_users(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace = state
        .registries
        .workspaces
        .get(&id)
        .await
        .map_err(ApiError::from)?;
    let users = match state.registries.users.get_by_id(&workspace.user_id).await {
        Ok(user) => vec![user],
        Err(AppError::NotFound) => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

/// `GET /api/v1/workspaces/:id/services`
pub async fn workspace_services(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let services = state
        .registries
        .workspaces
        .services(&id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "count": services.len(), "services": services })))
}
