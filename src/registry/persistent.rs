use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

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

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn user_from_row(row: &SqliteRow) -> AppResult<User> {
    Ok(User {
        user_id: row.get("user_id"),
        github_username: row.get("github_username"),
        ssh_public_key: row.get("ssh_public_key"),
        ssh_key_fingerprint: row.get("ssh_key_fingerprint"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn node_from_row(row: &SqliteRow) -> AppResult<Node> {
    let status: String = row.get("status");
    let labels: String = row.get("labels");
    let capabilities: String = row.get("capabilities");
    let services: Option<String> = row.get("services");
    let metadata: String = row.get("metadata");
    Ok(Node {
        id: row.get("id"),
        name: row.get("name"),
        provider: row.get("provider"),
        status: status.parse()?,
        address: row.get("address"),
        port: row.get::<i64, _>("port") as u16,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        services: services.and_then(|raw| serde_json::from_str(&raw).ok()),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_seen: row.get("last_seen"),
    })
}

fn installation_from_row(row: &SqliteRow) -> GitHubInstallation {
    GitHubInstallation {
        installation_id: row.get("installation_id"),
        user_id: row.get("user_id"),
        github_user_id: row.get("github_user_id"),
        github_username: row.get("github_username"),
        repo_full_name: row.get("repo_full_name"),
        token: row.get("token"),
        token_expires_at: row.get("token_expires_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn workspace_from_row(row: &SqliteRow) -> AppResult<Workspace> {
    let status: String = row.get("status");
    Ok(Workspace {
        workspace_id: row.get("workspace_id"),
        user_id: row.get("user_id"),
        workspace_name: row.get("workspace_name"),
        status: status.parse()?,
        provider: row.get("provider"),
        image: row.get("image"),
        repo_owner: row.get("repo_owner"),
        repo_name: row.get("repo_name"),
        repo_url: row.get("repo_url"),
        branch: row.get("branch"),
        commit: row.get("commit_sha"),
        is_fork: row.get::<i64, _>("is_fork") != 0,
        fork_url: row.get("fork_url"),
        ssh_host: row.get("ssh_host"),
        ssh_port: row
            .get::<Option<i64>, _>("ssh_port")
            .map(|p| p as u16),
        node_id: row.get("node_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn service_from_row(row: &SqliteRow) -> AppResult<Service> {
    let status: String = row.get("status");
    let health: String = row.get("health_status");
    let depends_on: String = row.get("depends_on");
    Ok(Service {
        service_id: row.get("service_id"),
        workspace_id: row.get("workspace_id"),
        name: row.get("name"),
        command: row.get("command"),
        port: row.get::<i64, _>("port") as u16,
        local_port: row
            .get::<Option<i64>, _>("local_port")
            .map(|p| p as u16),
        status: status.parse()?,
        health_status: health.parse()?,
        last_check: row.get::<Option<DateTime<Utc>>, _>("last_check"),
        depends_on: serde_json::from_str(&depends_on).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub struct DbUserRegistry {
    pool: SqlitePool,
}

impl DbUserRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRegistry for DbUserRegistry {
    async fn register(&self, user: User) -> AppResult<User> {
        require_key("github_username", &user.github_username)?;
        require_key("user_id", &user.user_id)?;
        let result = sqlx::query(
            "INSERT INTO users (user_id, github_username, ssh_public_key, ssh_key_fingerprint,
                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.user_id)
        .bind(&user.github_username)
        .bind(&user.ssh_public_key)
        .bind(&user.ssh_key_fingerprint)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(user),
            Err(err) if is_unique_violation(&err) => Err(AppError::Conflict(format!(
                "user {} is already registered",
                user.github_username
            ))),
            Err(err) => Err(AppError::Db(err)),
        }
    }

    async fn get(&self, github_username: &str) -> AppResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE github_username = ?")
            .bind(github_username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        user_from_row(&row)
    }

    async fn get_by_id(&self, user_id: &str) -> AppResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        user_from_row(&row)
    }

    async fn list(&self) -> AppResult<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY github_username")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn delete(&self, github_username: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE github_username = ?")
            .bind(github_username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

pub struct DbNodeRegistry {
    pool: SqlitePool,
}

impl DbNodeRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn persist(&self, node: &Node) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO nodes (id, name, provider, status, address, port, labels,
                capabilities, services, metadata, created_at, updated_at, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                provider = excluded.provider,
                status = excluded.status,
                address = excluded.address,
                port = excluded.port,
                labels = excluded.labels,
                capabilities = excluded.capabilities,
                services = excluded.services,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at,
                last_seen = excluded.last_seen",
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(&node.provider)
        .bind(node.status.as_str())
        .bind(&node.address)
        .bind(node.port as i64)
        .bind(serde_json::to_string(&node.labels).unwrap_or_else(|_| "{}".into()))
        .bind(serde_json::to_string(&node.capabilities).unwrap_or_else(|_| "{}".into()))
        .bind(
            node.services
                .as_ref()
                .and_then(|s| serde_json::to_string(s).ok()),
        )
        .bind(serde_json::to_string(&node.metadata).unwrap_or_else(|_| "{}".into()))
        .bind(node.created_at)
        .bind(node.updated_at)
        .bind(node.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeRegistry for DbNodeRegistry {
    async fn register(&self, node: Node) -> AppResult<Node> {
        require_key("id", &node.id)?;
        self.persist(&node).await?;
        Ok(node)
    }

    async fn list(&self) -> AppResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn get(&self, id: &str) -> AppResult<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        node_from_row(&row)
    }

    async fn update(&self, id: &str, fields: HashMap<String, Value>) -> AppResult<Node> {
        let mut node = self.get(id).await?;
        apply_node_fields(&mut node, &fields)?;
        self.persist(&node).await?;
        Ok(node)
    }

    async fn set_status(&self, id: &str, status: NodeStatus) -> AppResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE nodes SET status = ?, updated_at = ?, last_seen = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn heartbeat(&self, id: &str, status: Option<NodeStatus>) -> AppResult<()> {
        let now = Utc::now();
        let result = match status {
            Some(status) => {
                sqlx::query(
                    "UPDATE nodes SET status = ?, updated_at = ?, last_seen = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE nodes SET updated_at = ?, last_seen = ? WHERE id = ?")
                    .bind(now)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn get_by_label(&self, key: &str, value: &str) -> AppResult<Vec<Node>> {
        // Label maps are stored as JSON text; filter after decoding.
        let nodes = self.list().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.labels.get(key).map(String::as_str) == Some(value))
            .collect())
    }

    async fn get_by_capability(&self, capability: &str) -> AppResult<Vec<Node>> {
        let nodes = self.list().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.capabilities.get(capability).copied().unwrap_or(false))
            .collect())
    }

    async fn unregister(&self, id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

pub struct DbInstallationStore {
    pool: SqlitePool,
}

impl DbInstallationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstallationStore for DbInstallationStore {
    async fn store(&self, installation: GitHubInstallation) -> AppResult<()> {
        require_key("user_id", &installation.user_id)?;
        sqlx::query(
            "INSERT INTO github_installations (user_id, installation_id, github_user_id,
                github_username, repo_full_name, token, token_expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id) DO UPDATE SET
                installation_id = excluded.installation_id,
                github_user_id = excluded.github_user_id,
                github_username = excluded.github_username,
                repo_full_name = excluded.repo_full_name,
                token = excluded.token,
                token_expires_at = excluded.token_expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(&installation.user_id)
        .bind(installation.installation_id)
        .bind(installation.github_user_id)
        .bind(&installation.github_username)
        .bind(&installation.repo_full_name)
        .bind(&installation.token)
        .bind(installation.token_expires_at)
        .bind(installation.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: &str) -> AppResult<GitHubInstallation> {
        let row = sqlx::query("SELECT * FROM github_installations WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(installation_from_row(&row))
    }

    async fn get_by_username(&self, github_username: &str) -> AppResult<GitHubInstallation> {
        let row = sqlx::query("SELECT * FROM github_installations WHERE github_username = ?")
            .bind(github_username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(installation_from_row(&row))
    }
}

pub struct DbForkStore {
    pool: SqlitePool,
}

impl DbForkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ForkStore for DbForkStore {
    async fn store(&self, fork: GitHubFork) -> AppResult<()> {
        require_key("user_id", &fork.user_id)?;
        require_key("original_owner", &fork.original_owner)?;
        require_key("original_repo", &fork.original_repo)?;
        sqlx::query(
            "INSERT INTO github_forks (user_id, original_owner, original_repo, fork_owner,
                fork_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, original_owner, original_repo) DO NOTHING",
        )
        .bind(&fork.user_id)
        .bind(&fork.original_owner)
        .bind(&fork.original_repo)
        .bind(&fork.fork_owner)
        .bind(&fork.fork_url)
        .bind(fork.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<GitHubFork>> {
        let rows = sqlx::query(
            "SELECT user_id, original_owner, original_repo, fork_owner, fork_url, created_at
             FROM github_forks WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| GitHubFork {
                user_id: row.get("user_id"),
                original_owner: row.get("original_owner"),
                original_repo: row.get("original_repo"),
                fork_owner: row.get("fork_owner"),
                fork_url: row.get("fork_url"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

pub struct DbWorkspaceRegistry {
    pool: SqlitePool,
}

impl DbWorkspaceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkspaceRegistry for DbWorkspaceRegistry {
    async fn create(&self, workspace: Workspace) -> AppResult<Workspace> {
        require_key("workspace_id", &workspace.workspace_id)?;
        require_key("user_id", &workspace.user_id)?;
        require_key("repo_owner", &workspace.repo_owner)?;
        require_key("repo_name", &workspace.repo_name)?;
        require_key("repo_url", &workspace.repo_url)?;
        sqlx::query(
            "INSERT INTO workspaces (workspace_id, user_id, workspace_name, status, provider,
                image, repo_owner, repo_name, repo_url, branch, commit_sha, is_fork, fork_url,
                ssh_host, ssh_port, node_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workspace.workspace_id)
        .bind(&workspace.user_id)
        .bind(&workspace.workspace_name)
        .bind(workspace.status.as_str())
        .bind(&workspace.provider)
        .bind(&workspace.image)
        .bind(&workspace.repo_owner)
        .bind(&workspace.repo_name)
        .bind(&workspace.repo_url)
        .bind(&workspace.branch)
        .bind(&workspace.commit)
        .bind(workspace.is_fork as i64)
        .bind(&workspace.fork_url)
        .bind(&workspace.ssh_host)
        .bind(workspace.ssh_port.map(|p| p as i64))
        .bind(&workspace.node_id)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(workspace)
    }

    async fn get(&self, workspace_id: &str) -> AppResult<Workspace> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        workspace_from_row(&row)
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Workspace>> {
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let rows = match user_id {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM workspaces WHERE user_id = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(user)
                .bind(limit)
                .bind(offset.max(0))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM workspaces ORDER BY created_at DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset.max(0))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(workspace_from_row).collect()
    }

    async fn set_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()> {
        let current = self.get(workspace_id).await?;
        if !WorkspaceStatus::can_transition(current.status, status) {
            return Err(AppError::Validation(format!(
                "workspace status cannot move from {} to {}",
                current.status, status
            )));
        }
        sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE workspace_id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_ssh(&self, workspace_id: &str, host: &str, port: u16) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE workspaces SET ssh_host = ?, ssh_port = ?, updated_at = ?
             WHERE workspace_id = ?",
        )
        .bind(host)
        .bind(port as i64)
        .bind(Utc::now())
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn replace_services(
        &self,
        workspace_id: &str,
        services: Vec<Service>,
    ) -> AppResult<()> {
        self.get(workspace_id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM services WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&mut tx)
            .await?;
        for service in &services {
            sqlx::query(
                "INSERT INTO services (service_id, workspace_id, name, command, port,
                    local_port, status, health_status, last_check, depends_on,
                    created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&service.service_id)
            .bind(workspace_id)
            .bind(&service.name)
            .bind(&service.command)
            .bind(service.port as i64)
            .bind(service.local_port.map(|p| p as i64))
            .bind(service.status.as_str())
            .bind(service.health_status.as_str())
            .bind(service.last_check)
            .bind(serde_json::to_string(&service.depends_on).unwrap_or_else(|_| "[]".into()))
            .bind(service.created_at)
            .bind(service.updated_at)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_service_health(
        &self,
        workspace_id: &str,
        service_name: &str,
        health: HealthStatus,
    ) -> AppResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE services SET health_status = ?, last_check = ?, updated_at = ?
             WHERE workspace_id = ? AND name = ?",
        )
        .bind(health.as_str())
        .bind(now)
        .bind(now)
        .bind(workspace_id)
        .bind(service_name)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn services(&self, workspace_id: &str) -> AppResult<Vec<Service>> {
        self.get(workspace_id).await?;
        let rows = sqlx::query("SELECT * FROM services WHERE workspace_id = ? ORDER BY name")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn delete(&self, workspace_id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}
