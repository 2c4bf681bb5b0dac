use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub github_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Error,
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Error => "error",
            NodeStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "inactive" => Ok(NodeStatus::Inactive),
            "error" => Ok(NodeStatus::Error),
            "unknown" => Ok(NodeStatus::Unknown),
            other => Err(AppError::Validation(format!("invalid node status: {other}"))),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub status: NodeStatus,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Node registration accepts `capabilities` both as an object
/// (`{"docker": true}`) and as a list of names (`["docker"]`); a list is
/// normalized into a map with every named capability set to `true`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CapabilityInput {
    Map(HashMap<String, bool>),
    List(Vec<String>),
}

impl CapabilityInput {
    pub fn into_map(self) -> HashMap<String, bool> {
        match self {
            CapabilityInput::Map(map) => map,
            CapabilityInput::List(names) => {
                names.into_iter().map(|name| (name, true)).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubInstallation {
    pub installation_id: i64,
    pub user_id: String,
    pub github_user_id: i64,
    pub github_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_full_name: Option<String>,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubFork {
    pub user_id: String,
    pub original_owner: String,
    pub original_repo: String,
    pub fork_owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Creating => "creating",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Error => "error",
        }
    }

    /// Permitted lifecycle moves. A workspace may always move to `error`,
    /// and re-writing the current status is a no-op so that a restarted
    /// pipeline can re-enter `creating`.
    pub fn can_transition(from: WorkspaceStatus, to: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        if from == to || to == Error {
            return true;
        }
        matches!((from, to), (Pending, Creating) | (Creating, Running) | (Running, Stopped))
    }
}

impl FromStr for WorkspaceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkspaceStatus::Pending),
            "creating" => Ok(WorkspaceStatus::Creating),
            "running" => Ok(WorkspaceStatus::Running),
            "stopped" => Ok(WorkspaceStatus::Stopped),
            "error" => Ok(WorkspaceStatus::Error),
            other => Err(AppError::Validation(format!(
                "invalid workspace status: {other}"
            ))),
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub user_id: String,
    pub workspace_name: String,
    pub status: WorkspaceStatus,
    pub provider: String,
    pub image: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_url: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default)]
    pub is_fork: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Error,
    Unhealthy,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
            ServiceStatus::Unhealthy => "unhealthy",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ServiceStatus::Pending),
            "starting" => Ok(ServiceStatus::Starting),
            "running" => Ok(ServiceStatus::Running),
            "stopped" => Ok(ServiceStatus::Stopped),
            "error" => Ok(ServiceStatus::Error),
            "unhealthy" => Ok(ServiceStatus::Unhealthy),
            other => Err(AppError::Validation(format!(
                "invalid service status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
    Timeout,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" => Ok(HealthStatus::Unknown),
            "timeout" => Ok(HealthStatus::Timeout),
            other => Err(AppError::Validation(format!(
                "invalid health status: {other}"
            ))),
        }
    }
}

/// A process inside a workspace. Owned by exactly one workspace; deleting
/// the workspace deletes its services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub service_id: String,
    pub workspace_id: String,
    pub name: String,
    pub command: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    pub status: ServiceStatus,
    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Error,
    Timeout,
}

/// A dispatched node operation. Commands are transient: they are never
/// persisted, only relayed through the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub node_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_list_normalizes_to_map() {
        let input: CapabilityInput =
            serde_json::from_value(serde_json::json!(["docker", "compose"])).unwrap();
        let map = input.into_map();
        assert_eq!(map.get("docker"), Some(&true));
        assert_eq!(map.get("compose"), Some(&true));
    }

    #[test]
    fn capability_map_passes_through() {
        let input: CapabilityInput =
            serde_json::from_value(serde_json::json!({"docker": true, "kvm": false})).unwrap();
        let map = input.into_map();
        assert_eq!(map.get("docker"), Some(&true));
        assert_eq!(map.get("kvm"), Some(&false));
    }

    #[test]
    fn workspace_status_transitions() {
        use WorkspaceStatus::*;
        assert!(WorkspaceStatus::can_transition(Pending, Creating));
        assert!(WorkspaceStatus::can_transition(Creating, Running));
        assert!(WorkspaceStatus::can_transition(Creating, Error));
        assert!(WorkspaceStatus::can_transition(Running, Stopped));
        assert!(WorkspaceStatus::can_transition(Creating, Creating));
        assert!(!WorkspaceStatus::can_transition(Pending, Running));
        assert!(!WorkspaceStatus::can_transition(Stopped, Running));
        assert!(!WorkspaceStatus::can_transition(Error, Running));
    }

    #[test]
    fn workspace_status_rejects_unknown_value() {
        assert!("provisioning".parse::<WorkspaceStatus>().is_err());
    }
}
