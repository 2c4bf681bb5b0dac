pub mod memory;
pub mod persistent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::error::AppResult;
use crate::models::{
    GitHubFork, GitHubInstallation, HealthStatus, Node, NodeStatus, Service, User, Workspace,
    WorkspaceStatus,
};

#[async_trait]
pub trait UserRegistry: Send + Sync {
    /// Register a user. Re-registering an existing `github_username` is a
    /// conflict.
    async fn register(&self, user: User) -> AppResult<User>;
    async fn get(&self, github_username: &str) -> AppResult<User>;
    async fn get_by_id(&self, user_id: &str) -> AppResult<User>;
    async fn list(&self) -> AppResult<Vec<User>>;
    async fn delete(&self, github_username: &str) -> AppResult<()>;
}

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn register(&self, node: Node) -> AppResult<Node>;
    async fn list(&self) -> AppResult<Vec<Node>>;
    async fn get(&self, id: &str) -> AppResult<Node>;
    /// Apply an opaque field-to-value map. Unknown fields are ignored;
    /// typed fields validate their value shape.
    async fn update(&self, id: &str, fields: HashMap<String, Value>) -> AppResult<Node>;
    async fn set_status(&self, id: &str, status: NodeStatus) -> AppResult<()>;
    /// Refresh `last_seen`, optionally moving status.
    async fn heartbeat(&self, id: &str, status: Option<NodeStatus>) -> AppResult<()>;
    async fn get_by_label(&self, key: &str, value: &str) -> AppResult<Vec<Node>>;
    async fn get_by_capability(&self, capability: &str) -> AppResult<Vec<Node>>;
    async fn unregister(&self, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// Upsert keyed by `user_id`: one installation per user.
    async fn store(&self, installation: GitHubInstallation) -> AppResult<()>;
    async fn get(&self, user_id: &str) -> AppResult<GitHubInstallation>;
    async fn get_by_username(&self, github_username: &str) -> AppResult<GitHubInstallation>;
}

#[async_trait]
pub trait ForkStore: Send + Sync {
    /// Idempotent insert keyed by `(user_id, original_owner, original_repo)`.
    async fn store(&self, fork: GitHubFork) -> AppResult<()>;
    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<GitHubFork>>;
}

#[async_trait]
pub trait WorkspaceRegistry: Send + Sync {
    async fn create(&self, workspace: Workspace) -> AppResult<Workspace>;
    async fn get(&self, workspace_id: &str) -> AppResult<Workspace>;
    async fn list(
        &self,
        user_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Workspace>>;
    /// Status-only update, validated against the workspace state machine.
    async fn set_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()>;
    async fn bind_ssh(&self, workspace_id: &str, host: &str, port: u16) -> AppResult<()>;
    /// Replace the workspace's whole service set in one operation.
    async fn replace_services(
        &self,
        workspace_id: &str,
        services: Vec<Service>,
    ) -> AppResult<()>;
    async fn update_service_health(
        &self,
        workspace_id: &str,
        service_name: &str,
        health: HealthStatus,
    ) -> AppResult<()>;
    async fn services(&self, workspace_id: &str) -> AppResult<Vec<Service>>;
    /// Hard removal; owned services go with the workspace.
    async fn delete(&self, workspace_id: &str) -> AppResult<()>;
}

/// Apply an opaque update map to a node in place. Unknown fields are
/// ignored; typed fields reject values of the wrong shape.
pub(crate) fn apply_node_fields(
    node: &mut Node,
    fields: &HashMap<String, Value>,
) -> AppResult<()> {
    use crate::error::AppError;

    fn expect_str(field: &str, value: &Value) -> AppResult<String> {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| AppError::Validation(format!("field {field} must be a string")))
    }

    for (field, value) in fields {
        match field.as_str() {
            "name" => node.name = expect_str(field, value)?,
            "provider" => node.provider = expect_str(field, value)?,
            "address" => node.address = expect_str(field, value)?,
            "status" => node.status = expect_str(field, value)?.parse()?,
            "port" => {
                node.port = value
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| {
                        AppError::Validation(format!("field {field} must be a port number"))
                    })?;
            }
            "labels" => {
                node.labels = serde_json::from_value(value.clone()).map_err(|_| {
                    AppError::Validation("field labels must be a string map".into())
                })?;
            }
            "capabilities" => {
                let input: crate::models::CapabilityInput = serde_json::from_value(value.clone())
                    .map_err(|_| {
                        AppError::Validation(
                            "field capabilities must be a bool map or name list".into(),
                        )
                    })?;
                node.capabilities = input.into_map();
            }
            "services" => {
                node.services = serde_json::from_value(value.clone()).map_err(|_| {
                    AppError::Validation("field services must be an object".into())
                })?;
            }
            "metadata" => {
                node.metadata = serde_json::from_value(value.clone()).map_err(|_| {
                    AppError::Validation("field metadata must be an object".into())
                })?;
            }
            _ => {}
        }
    }
    let now = chrono::Utc::now();
    node.updated_at = now;
    node.last_seen = now;
    Ok(())
}

/// The coordination process exclusively owns all mutations; handlers and the
/// pipeline go through this bundle.
#[derive(Clone)]
pub struct Registries {
    pub users: Arc<dyn UserRegistry>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub installations: Arc<dyn InstallationStore>,
    pub forks: Arc<dyn ForkStore>,
    pub workspaces: Arc<dyn WorkspaceRegistry>,
}

impl Registries {
    /// In-memory registries for tests and ephemeral runs.
    pub fn memory() -> Self {
        Self {
            users: Arc::new(memory::MemoryUserRegistry::default()),
            nodes: Arc::new(memory::MemoryNodeRegistry::default()),
            installations: Arc::new(memory::MemoryInstallationStore::default()),
            forks: Arc::new(memory::MemoryForkStore::default()),
            workspaces: Arc::new(memory::MemoryWorkspaceRegistry::default()),
        }
    }

    /// Registries backed by the single-file database.
    pub fn persistent(pool: SqlitePool) -> Self {
        Self {
            users: Arc::new(persistent::DbUserRegistry::new(pool.clone())),
            nodes: Arc::new(persistent::DbNodeRegistry::new(pool.clone())),
            installations: Arc::new(persistent::DbInstallationStore::new(pool.clone())),
            forks: Arc::new(persistent::DbForkStore::new(pool.clone())),
            workspaces: Arc::new(persistent::DbWorkspaceRegistry::new(pool)),
        }
    }
}
