use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{HealthStatus, Service, ServiceStatus, Workspace, WorkspaceStatus};
use crate::provider::{ExecSpec, Provider, ProviderSession, WorkspaceConfig};
use crate::state::AppState;

static GITHUB_HTTPS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://github\.com/").expect("valid regex"));

const CONVERGE_INTERVAL: Duration = Duration::from_secs(2);
const CONVERGE_BUDGET: Duration = Duration::from_secs(30);

/// A service named in the create-from-repo request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestedService {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error("{stage}: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },
}

fn stage_err(stage: &'static str, message: impl ToString) -> PipelineError {
    PipelineError::Stage {
        stage,
        message: message.to_string(),
    }
}

/// Resolves when the process-wide shutdown flag flips. A dropped sender
/// means shutdown can no longer be signalled, so the future never resolves.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn stage<T>(
    shutdown: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        _ = shutdown_signal(shutdown) => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}

/// Detach the provisioning pipeline for one workspace. Deliberately not
/// tied to the request context: a client disconnect must not abort
/// provisioning, only process shutdown does.
pub fn spawn(
    state: AppState,
    workspace: Workspace,
    token: Option<String>,
    services: Vec<RequestedService>,
) {
    tokio::spawn(async move {
        let workspace_id = workspace.workspace_id.clone();
        if let Err(err) = run(&state, workspace, token, services).await {
            tracing::error!(%workspace_id, ?err, "provisioning failed");
            if let Err(err) = state
                .registries
                .workspaces
                .set_status(&workspace_id, WorkspaceStatus::Error)
                .await
            {
                tracing::error!(%workspace_id, ?err, "failed to mark workspace error");
            }
        }
    });
}

async fn run(
    state: &AppState,
    workspace: Workspace,
    token: Option<String>,
    requested: Vec<RequestedService>,
) -> Result<(), PipelineError> {
    let mut shutdown = state.shutdown.clone();
    let workspace_id = workspace.workspace_id.clone();
    let registries = &state.registries;

    // Stage 1: mark status and bind the tentative SSH endpoint.
    registries
        .workspaces
        .set_status(&workspace_id, WorkspaceStatus::Creating)
        .await
        .map_err(|e| stage_err("mark-creating", e))?;
    let ssh_port = workspace.ssh_port.unwrap_or(2222);
    registries
        .workspaces
        .bind_ssh(&workspace_id, "localhost", ssh_port)
        .await
        .map_err(|e| stage_err("bind-ssh", e))?;

    // Stage 2: shallow clone of the requested branch.
    let workspace_dir = state.workspace_root.join(&workspace_id);
    tracing::info!(%workspace_id, repo = %workspace.repo_url, branch = %workspace.branch, "cloning repository");
    stage(
        &mut shutdown,
        clone_repository(
            workspace.repo_url.clone(),
            workspace.branch.clone(),
            token,
            workspace_dir.clone(),
        ),
    )
    .await?;

    // Stage 3: in-tree config, defaulting on absence or parse failure.
    let config = load_workspace_config(&workspace_dir).await;

    provision_container(state, &workspace, &workspace_dir, config, requested).await
}

/// Stages 4–10: container lifecycle against the bound provider. Split from
/// the clone so driver behavior can be exercised in isolation.
pub async fn provision_container(
    state: &AppState,
    workspace: &Workspace,
    workspace_dir: &Path,
    config: WorkspaceConfig,
    requested: Vec<RequestedService>,
) -> Result<(), PipelineError> {
    let mut shutdown = state.shutdown.clone();
    let workspace_id = workspace.workspace_id.clone();
    let registries = &state.registries;

    // Stage 4/5: provider agreement, then create and start the container.
    let provider = state
        .provider
        .clone()
        .ok_or_else(|| stage_err("provider", "no provider is bound to this coordinator"))?;
    if provider.name() != workspace.provider {
        return Err(stage_err(
            "provider",
            format!(
                "workspace requests provider {} but {} is bound",
                workspace.provider,
                provider.name()
            ),
        ));
    }
    let session = stage(&mut shutdown, async {
        provider
            .create(&workspace_id, workspace_dir, &config)
            .await
            .map_err(|e| stage_err("create", e))
    })
    .await?;
    stage(&mut shutdown, async {
        provider
            .start(&session.id)
            .await
            .map_err(|e| stage_err("start", e))
    })
    .await?;

    // Stage 6: best-effort SSH authorized-keys injection.
    stage(
        &mut shutdown,
        inject_ssh_keys(state, &provider, &session, workspace),
    )
    .await?;

    // Stage 7: port mappings and service env injection.
    let mappings = stage(&mut shutdown, async {
        match provider.port_mappings(&session.id).await {
            Ok(mappings) => Ok(mappings.unwrap_or_default()),
            Err(err) => {
                tracing::warn!(%workspace_id, ?err, "port mapping discovery failed");
                Ok(HashMap::new())
            }
        }
    })
    .await?;

    let merged = merge_services(&requested, &config);
    for service in &merged {
        if let Some(port) = service.port {
            if let Some(host_port) = mappings.get(&port) {
                let line = format!(
                    "export {}={host_port}",
                    service_port_env(&service.name)
                );
                let spec = ExecSpec::shell(format!("echo '{line}' >> /etc/environment"));
                if let Err(err) = provider.exec(&session.id, spec).await {
                    tracing::warn!(%workspace_id, service = %service.name, ?err, "env injection failed");
                }
            }
        }
    }
    if let Some(host_ssh) = mappings.get(&22) {
        registries
            .workspaces
            .bind_ssh(&workspace_id, "localhost", *host_ssh)
            .await
            .map_err(|e| stage_err("bind-ssh", e))?;
    }

    // Stage 8: register the service set in one replacement.
    let now = Utc::now();
    let rows: Vec<Service> = merged
        .iter()
        .map(|service| Service {
            service_id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.clone(),
            name: service.name.clone(),
            command: service.command.clone().unwrap_or_default(),
            port: service.port.unwrap_or(0),
            local_port: service.port.and_then(|p| mappings.get(&p).copied()),
            status: ServiceStatus::Running,
            health_status: HealthStatus::Healthy,
            last_check: Some(now),
            depends_on: service.depends_on.clone(),
            created_at: now,
            updated_at: now,
        })
        .collect();
    registries
        .workspaces
        .replace_services(&workspace_id, rows)
        .await
        .map_err(|e| stage_err("register-services", e))?;

    // Stage 9: bounded convergence. Exhaustion is tolerated; the services
    // belong to the workspace either way.
    stage(&mut shutdown, converge(&provider, &session, &workspace_id)).await?;

    // Stage 10: running.
    registries
        .workspaces
        .set_status(&workspace_id, WorkspaceStatus::Running)
        .await
        .map_err(|e| stage_err("mark-running", e))?;
    tracing::info!(%workspace_id, "workspace provisioned");
    Ok(())
}

/// Depth-1 clone. A GitHub HTTPS URL gains the user's token so private
/// repos clone without prompting; git2 never falls back to an interactive
/// credential helper.
async fn clone_repository(
    repo_url: String,
    branch: String,
    token: Option<String>,
    dest: PathBuf,
) -> Result<(), PipelineError> {
    let effective_url = match &token {
        Some(token) if GITHUB_HTTPS.is_match(&repo_url) => {
            GITHUB_HTTPS
                .replace(&repo_url, format!("https://{token}@github.com/"))
                .into_owned()
        }
        _ => repo_url.clone(),
    };
    tokio::task::spawn_blocking(move || {
        if dest.exists() {
            std::fs::remove_dir_all(&dest)
                .map_err(|e| stage_err("clone", format!("cleaning workspace dir: {e}")))?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| stage_err("clone", format!("creating workspace root: {e}")))?;
        }
        let mut fetch = git2::FetchOptions::new();
        fetch.depth(1);
        let mut builder = git2::build::RepoBuilder::new();
        builder.branch(&branch);
        builder.fetch_options(fetch);
        builder
            .clone(&effective_url, &dest)
            .map(|_| ())
            .map_err(|e| stage_err("clone", e.message()))
    })
    .await
    .map_err(|e| stage_err("clone", e))?
}

async fn load_workspace_config(workspace_dir: &Path) -> WorkspaceConfig {
    let path = workspace_dir.join(".nexus").join("config.yaml");
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "invalid workspace config, using defaults");
                WorkspaceConfig::default()
            }
        },
        Err(_) => WorkspaceConfig::default(),
    }
}

/// Fetch the user's public keys from GitHub and wire up sshd inside the
/// container. Every failure here is soft: a workspace without SSH access
/// is degraded, not dead.
async fn inject_ssh_keys(
    state: &AppState,
    provider: &Arc<dyn Provider>,
    session: &ProviderSession,
    workspace: &Workspace,
) -> Result<(), PipelineError> {
    let username = match state.registries.users.get_by_id(&workspace.user_id).await {
        Ok(user) => user.github_username,
        Err(_) => workspace.user_id.clone(),
    };
    let keys = match state.github.user_keys(&username).await {
        Ok(keys) if !keys.trim().is_empty() => keys,
        Ok(_) => {
            tracing::warn!(workspace_id = %workspace.workspace_id, %username, "no public keys on github, skipping ssh setup");
            return Ok(());
        }
        Err(err) => {
            tracing::warn!(workspace_id = %workspace.workspace_id, ?err, "key fetch failed, skipping ssh setup");
            return Ok(());
        }
    };

    let steps = [
        "mkdir -p /root/.ssh && chmod 700 /root/.ssh".to_string(),
        format!(
            "printf '%s\\n' '{}' > /root/.ssh/authorized_keys && chmod 600 /root/.ssh/authorized_keys",
            keys.trim().replace('\'', "'\\''")
        ),
        "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq openssh-server"
            .to_string(),
        "sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config && \
         sed -i 's/^#\\?PubkeyAuthentication.*/PubkeyAuthentication yes/' /etc/ssh/sshd_config"
            .to_string(),
        "mkdir -p /run/sshd && /usr/sbin/sshd".to_string(),
    ];
    for step in steps {
        match provider.exec(&session.id, ExecSpec::shell(step.clone())).await {
            Ok(output) if !output.success() => {
                tracing::warn!(
                    workspace_id = %workspace.workspace_id,
                    exit_code = output.exit_code,
                    stderr = %output.stderr,
                    "ssh setup step failed, continuing"
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(workspace_id = %workspace.workspace_id, ?err, "ssh setup exec failed, continuing");
                return Ok(());
            }
        }
    }
    Ok(())
}

/// `NEXUS_SERVICE_<NAME>_PORT`, with the service name uppercased and
/// non-alphanumerics folded to underscores.
pub fn service_port_env(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("NEXUS_SERVICE_{upper}_PORT")
}

fn merge_services(
    requested: &[RequestedService],
    config: &WorkspaceConfig,
) -> Vec<RequestedService> {
    let mut merged: Vec<RequestedService> = requested.to_vec();
    for (name, spec) in &config.services {
        if merged.iter().any(|s| &s.name == name) {
            continue;
        }
        merged.push(RequestedService {
            name: name.clone(),
            command: Some(spec.command.clone()).filter(|c| !c.is_empty()),
            port: spec.port,
            depends_on: spec.depends_on.clone(),
        });
    }
    merged
}

/// Poll container reachability with a trivial exec until it answers or the
/// budget runs out. Exhaustion is accepted.
async fn converge(
    provider: &Arc<dyn Provider>,
    session: &ProviderSession,
    workspace_id: &str,
) -> Result<(), PipelineError> {
    let deadline = tokio::time::Instant::now() + CONVERGE_BUDGET;
    let mut ticker = tokio::time::interval(CONVERGE_INTERVAL);
    loop {
        ticker.tick().await;
        match provider
            .exec(&session.id, ExecSpec::shell("echo nexus-healthcheck"))
            .await
        {
            Ok(output) if output.success() => return Ok(()),
            Ok(_) | Err(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(%workspace_id, "health convergence budget exhausted, proceeding");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_name_uppercases_and_folds_separators() {
        assert_eq!(service_port_env("web"), "NEXUS_SERVICE_WEB_PORT");
        assert_eq!(service_port_env("api-server"), "NEXUS_SERVICE_API_SERVER_PORT");
    }

    #[test]
    fn config_services_fill_in_behind_requested_ones() {
        let requested = vec![RequestedService {
            name: "web".into(),
            command: Some("npm start".into()),
            port: Some(3000),
            depends_on: vec![],
        }];
        let mut config = WorkspaceConfig::default();
        config.services.insert(
            "web".into(),
            crate::provider::ServiceSpec {
                command: "ignored".into(),
                port: Some(9999),
                depends_on: vec![],
            },
        );
        config.services.insert(
            "db".into(),
            crate::provider::ServiceSpec {
                command: "postgres".into(),
                port: Some(5432),
                depends_on: vec![],
            },
        );
        let merged = merge_services(&requested, &config);
        assert_eq!(merged.len(), 2);
        let web = merged.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.port, Some(3000));
        let db = merged.iter().find(|s| s.name == "db").unwrap();
        assert_eq!(db.command.as_deref(), Some("postgres"));
    }
}
