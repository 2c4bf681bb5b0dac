use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    apply_node_fields, ForkStore, InstallationStore, NodeRegistry, UserRegistry,
    WorkspaceRegistry,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    GitHubFork, GitHubInstallation, HealthStatus, Node, NodeStatus, Service, User, Workspace,
    WorkspaceStatus,
};

fn require_key(field: &'static str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryUserRegistry {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait]
impl UserRegistry for MemoryUserRegistry {
    async fn register(&self, user: User) -> AppResult<User> {
        require_key("github_username", &user.github_username)?;
        require_key("user_id", &user.user_id)?;
        let mut users = self.users.write().await;
        if users.contains_key(&user.github_username) {
            return Err(AppError::Conflict(format!(
                "user {} is already registered",
                user.github_username
            )));
        }
        users.insert(user.github_username.clone(), user.clone());
        Ok(user)
    }

    async fn get(&self, github_username: &str) -> AppResult<User> {
        self.users
            .read()
            .await
            .get(github_username)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn get_by_id(&self, user_id: &str) -> AppResult<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.user_id == user_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn list(&self) -> AppResult<Vec<User>> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.github_username.cmp(&b.github_username));
        Ok(users)
    }

    async fn delete(&self, github_username: &str) -> AppResult<()> {
        self.users
            .write()
            .await
            .remove(github_username)
            .map(|_| ())
            .ok_or(AppError::NotFound)
    }
}

#[derive(Default)]
pub struct MemoryNodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn register(&self, node: Node) -> AppResult<Node> {
        require_key("id", &node.id)?;
        self.nodes.write().await.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn list(&self) -> AppResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn get(&self, id: &str) -> AppResult<Node> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn update(&self, id: &str, fields: HashMap<String, Value>) -> AppResult<Node> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(id).ok_or(AppError::NotFound)?;
        apply_node_fields(node, &fields)?;
        Ok(node.clone())
    }

    async fn set_status(&self, id: &str, status: NodeStatus) -> AppResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(id).ok_or(AppError::NotFound)?;
        node.status = status;
        let now = Utc::now();
        node.updated_at = now;
        node.last_seen = now;
        Ok(())
    }

    async fn heartbeat(&self, id: &str, status: Option<NodeStatus>) -> AppResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(id).ok_or(AppError::NotFound)?;
        if let Some(status) = status {
            node.status = status;
        }
        let now = Utc::now();
        node.updated_at = now;
        node.last_seen = now;
        Ok(())
    }

    async fn get_by_label(&self, key: &str, value: &str) -> AppResult<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn get_by_capability(&self, capability: &str) -> AppResult<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.capabilities.get(capability).copied().unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn unregister(&self, id: &str) -> AppResult<()> {
        self.nodes
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(AppError::NotFound)
    }
}

#[derive(Default)]
pub struct MemoryInstallationStore {
    installations: RwLock<HashMap<String, GitHubInstallation>>,
}

#[async_trait]
impl InstallationStore for MemoryInstallationStore {
    async fn store(&self, mut installation: GitHubInstallation) -> AppResult<()> {
        require_key("user_id", &installation.user_id)?;
        let mut installations = self.installations.write().await;
        if let Some(existing) = installations.get(&installation.user_id) {
            installation.created_at = existing.created_at;
        }
        installation.updated_at = Utc::now();
        installations.insert(installation.user_id.clone(), installation);
        Ok(())
    }

    async fn get(&self, user_id: &str) -> AppResult<GitHubInstallation> {
        self.installations
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn get_by_username(&self, github_username: &str) -> AppResult<GitHubInstallation> {
        self.installations
            .read()
            .await
            .values()
            .find(|i| i.github_username == github_username)
            .cloned()
            .ok_or(AppError::NotFound)
    }
}

#[derive(Default)]
pub struct MemoryForkStore {
    forks: RwLock<HashMap<(String, String, String), GitHubFork>>,
}

#[async_trait]
impl ForkStore for MemoryForkStore {
    async fn store(&self, fork: GitHubFork) -> AppResult<()> {
        require_key("user_id", &fork.user_id)?;
        require_key("original_owner", &fork.original_owner)?;
        require_key("original_repo", &fork.original_repo)?;
        let key = (
            fork.user_id.clone(),
            fork.original_owner.clone(),
            fork.original_repo.clone(),
        );
        self.forks.write().await.entry(key).or_insert(fork);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<GitHubFork>> {
        Ok(self
            .forks
            .read()
            .await
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryWorkspaceRegistry {
    workspaces: RwLock<HashMap<String, Workspace>>,
    services: RwLock<HashMap<String, Vec<Service>>>,
}

#[async_trait]
impl WorkspaceRegistry for MemoryWorkspaceRegistry {
    async fn create(&self, workspace: Workspace) -> AppResult<Workspace> {
        require_key("workspace_id", &workspace.workspace_id)?;
        require_key("user_id", &workspace.user_id)?;
        require_key("repo_owner", &workspace.repo_owner)?;
        require_key("repo_name", &workspace.repo_name)?;
        require_key("repo_url", &workspace.repo_url)?;
        self.workspaces
            .write()
            .await
            .insert(workspace.workspace_id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn get(&self, workspace_id: &str) -> AppResult<Workspace> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Workspace>> {
        let workspaces = self.workspaces.read().await;
        let mut matching: Vec<Workspace> = workspaces
            .values()
            .filter(|w| user_id.map_or(true, |u| w.user_id == u))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(if limit <= 0 { usize::MAX } else { limit as usize })
            .collect())
    }

    async fn set_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.get_mut(workspace_id).ok_or(AppError::NotFound)?;
        if !WorkspaceStatus::can_transition(workspace.status, status) {
            return Err(AppError::Validation(format!(
                "workspace status cannot move from {} to {}",
                workspace.status, status
            )));
        }
        workspace.status = status;
        workspace.updated_at = Utc::now();
        Ok(())
    }

    async fn bind_ssh(&self, workspace_id: &str, host: &str, port: u16) -> AppResult<()> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.get_mut(workspace_id).ok_or(AppError::NotFound)?;
        workspace.ssh_host = Some(host.to_string());
        workspace.ssh_port = Some(port);
        workspace.updated_at = Utc::now();
        Ok(())
    }

    async fn replace_services(
        &self,
        workspace_id: &str,
        services: Vec<Service>,
    ) -> AppResult<()> {
        if !self.workspaces.read().await.contains_key(workspace_id) {
            return Err(AppError::NotFound);
        }
        self.services
            .write()
            .await
            .insert(workspace_id.to_string(), services);
        Ok(())
    }

    async fn update_service_health(
        &self,
        workspace_id: &str,
        service_name: &str,
        health: HealthStatus,
    ) -> AppResult<()> {
        let mut services = self.services.write().await;
        let list = services.get_mut(workspace_id).ok_or(AppError::NotFound)?;
        let service = list
            .iter_mut()
            .find(|s| s.name == service_name)
            .ok_or(AppError::NotFound)?;
        service.health_status = health;
        let now = Utc::now();
        service.last_check = Some(now);
        service.updated_at = now;
        Ok(())
    }

    async fn services(&self, workspace_id: &str) -> AppResult<Vec<Service>> {
        if !self.workspaces.read().await.contains_key(workspace_id) {
            return Err(AppError::NotFound);
        }
        Ok(self
            .services
            .read()
            .await
            .get(workspace_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, workspace_id: &str) -> AppResult<()> {
        let removed = self.workspaces.write().await.remove(workspace_id);
        self.services.write().await.remove(workspace_id);
        removed.map(|_| ()).ok_or(AppError::NotFound)
    }
}
