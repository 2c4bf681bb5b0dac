use std::collections::HashMap;

use chrono::Utc;
use nexus_coordination::models::{
    GitHubFork, GitHubInstallation, HealthStatus, Node, NodeStatus, Service, ServiceStatus, User,
    Workspace, WorkspaceStatus,
};
use nexus_coordination::registry::Registries;
use nexus_coordination::{storage, AppError};
use serde_json::json;

fn sample_user(username: &str) -> User {
    let now = Utc::now();
    User {
        user_id: format!("user-{username}"),
        github_username: username.to_string(),
        ssh_public_key: None,
        ssh_key_fingerprint: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_node(id: &str) -> Node {
    let now = Utc::now();
    Node {
        id: id.to_string(),
        name: format!("node {id}"),
        provider: "docker".into(),
        status: NodeStatus::Active,
        address: "10.0.0.4".into(),
        port: 8080,
        labels: HashMap::from([("zone".to_string(), "eu".to_string())]),
        capabilities: HashMap::from([("docker".to_string(), true)]),
        services: None,
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
        last_seen: now,
    }
}

fn sample_installation(user_id: &str, token: &str) -> GitHubInstallation {
    let now = Utc::now();
    GitHubInstallation {
        installation_id: 0,
        user_id: user_id.to_string(),
        github_user_id: 42,
        github_username: "alice".into(),
        repo_full_name: Some("owner/repo".into()),
        token: token.to_string(),
        token_expires_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_workspace(id: &str, user_id: &str) -> Workspace {
    let now = Utc::now();
    Workspace {
        workspace_id: id.to_string(),
        user_id: user_id.to_string(),
        workspace_name: "ws1".into(),
        status: WorkspaceStatus::Pending,
        provider: "docker".into(),
        image: "ubuntu:22.04".into(),
        repo_owner: "owner".into(),
        repo_name: "repo".into(),
        repo_url: "https://github.com/owner/repo.git".into(),
        branch: "main".into(),
        commit: None,
        is_fork: false,
        fork_url: None,
        ssh_host: None,
        ssh_port: None,
        node_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_service(workspace_id: &str, name: &str, port: u16) -> Service {
    let now = Utc::now();
    Service {
        service_id: format!("svc-{name}"),
        workspace_id: workspace_id.to_string(),
        name: name.to_string(),
        command: "run".into(),
        port,
        local_port: None,
        status: ServiceStatus::Running,
        health_status: HealthStatus::Healthy,
        last_check: None,
        depends_on: vec![],
        created_at: now,
        updated_at: now,
    }
}

async fn persistent_registries(dir: &tempfile::TempDir) -> Registries {
    let path = dir.path().join("coordination.db");
    let pool = storage::connect(path.to_str().unwrap()).await.unwrap();
    storage::run_migrations(&pool).await.unwrap();
    Registries::persistent(pool)
}

async fn both() -> Vec<(Registries, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let persistent = persistent_registries(&dir).await;
    vec![(Registries::memory(), None), (persistent, Some(dir))]
}

#[tokio::test]
async fn duplicate_username_is_a_conflict() {
    for (registries, _guard) in both().await {
        registries.users.register(sample_user("alice")).await.unwrap();
        let err = registries
            .users
            .register(sample_user("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn empty_username_fails_validation() {
    for (registries, _guard) in both().await {
        let err = registries
            .users
            .register(sample_user(""))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn installation_store_upserts_on_user_id() {
    for (registries, _guard) in both().await {
        registries
            .installations
            .store(sample_installation("u1", "token-one"))
            .await
            .unwrap();
        registries
            .installations
            .store(sample_installation("u1", "token-two"))
            .await
            .unwrap();
        let stored = registries.installations.get("u1").await.unwrap();
        assert_eq!(stored.token, "token-two");
        // Still exactly one record for the user.
        assert!(registries.installations.get_by_username("alice").await.is_ok());
    }
}

#[tokio::test]
async fn fork_insert_is_idempotent() {
    for (registries, _guard) in both().await {
        let fork = GitHubFork {
            user_id: "u1".into(),
            original_owner: "owner".into(),
            original_repo: "repo".into(),
            fork_owner: "alice".into(),
            fork_url: Some("https://github.com/alice/repo".into()),
            created_at: Utc::now(),
        };
        registries.forks.store(fork.clone()).await.unwrap();
        registries.forks.store(fork).await.unwrap();
        let forks = registries.forks.list_for_user("u1").await.unwrap();
        assert_eq!(forks.len(), 1);
    }
}

#[tokio::test]
async fn workspace_status_machine_rejects_invalid_moves() {
    for (registries, _guard) in both().await {
        registries
            .workspaces
            .create(sample_workspace("ws-1", "u1"))
            .await
            .unwrap();

        // pending -> running skips creating and must fail.
        let err = registries
            .workspaces
            .set_status("ws-1", WorkspaceStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "got {err:?}");

        registries
            .workspaces
            .set_status("ws-1", WorkspaceStatus::Creating)
            .await
            .unwrap();
        registries
            .workspaces
            .set_status("ws-1", WorkspaceStatus::Running)
            .await
            .unwrap();
        registries
            .workspaces
            .set_status("ws-1", WorkspaceStatus::Stopped)
            .await
            .unwrap();
        let ws = registries.workspaces.get("ws-1").await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Stopped);
    }
}

#[tokio::test]
async fn workspace_missing_repo_fields_fail_validation() {
    for (registries, _guard) in both().await {
        let mut ws = sample_workspace("ws-2", "u1");
        ws.repo_url = String::new();
        let err = registries.workspaces.create(ws).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn replace_services_swaps_the_whole_set() {
    for (registries, _guard) in both().await {
        registries
            .workspaces
            .create(sample_workspace("ws-3", "u1"))
            .await
            .unwrap();
        registries
            .workspaces
            .replace_services(
                "ws-3",
                vec![
                    sample_service("ws-3", "web", 3000),
                    sample_service("ws-3", "db", 5432),
                ],
            )
            .await
            .unwrap();
        registries
            .workspaces
            .replace_services("ws-3", vec![sample_service("ws-3", "api", 8000)])
            .await
            .unwrap();
        let services = registries.workspaces.services("ws-3").await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "api");
    }
}

#[tokio::test]
async fn service_health_updates_touch_last_check() {
    for (registries, _guard) in both().await {
        registries
            .workspaces
            .create(sample_workspace("ws-4", "u1"))
            .await
            .unwrap();
        registries
            .workspaces
            .replace_services("ws-4", vec![sample_service("ws-4", "web", 3000)])
            .await
            .unwrap();
        registries
            .workspaces
            .update_service_health("ws-4", "web", HealthStatus::Unhealthy)
            .await
            .unwrap();
        let services = registries.workspaces.services("ws-4").await.unwrap();
        assert_eq!(services[0].health_status, HealthStatus::Unhealthy);
        assert!(services[0].last_check.is_some());
    }
}

#[tokio::test]
async fn node_update_ignores_unknown_fields_and_validates_known_ones() {
    for (registries, _guard) in both().await {
        registries.nodes.register(sample_node("node-1")).await.unwrap();

        let node = registries
            .nodes
            .update(
                "node-1",
                HashMap::from([
                    ("name".to_string(), json!("renamed")),
                    ("definitely_unknown".to_string(), json!({"x": 1})),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(node.name, "renamed");

        let err = registries
            .nodes
            .update(
                "node-1",
                HashMap::from([("status".to_string(), json!("sideways"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn node_lookup_by_label_and_capability() {
    for (registries, _guard) in both().await {
        registries.nodes.register(sample_node("node-1")).await.unwrap();
        let mut other = sample_node("node-2");
        other.labels.insert("zone".into(), "us".into());
        other.capabilities.insert("kvm".into(), true);
        other.capabilities.insert("docker".into(), false);
        registries.nodes.register(other).await.unwrap();

        let eu = registries.nodes.get_by_label("zone", "eu").await.unwrap();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].id, "node-1");

        let docker = registries.nodes.get_by_capability("docker").await.unwrap();
        assert_eq!(docker.len(), 1);
        assert_eq!(docker[0].id, "node-1");
    }
}

#[tokio::test]
async fn node_set_status_refreshes_last_seen() {
    for (registries, _guard) in both().await {
        let registered = registries.nodes.register(sample_node("node-1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registries
            .nodes
            .set_status("node-1", NodeStatus::Inactive)
            .await
            .unwrap();
        let node = registries.nodes.get("node-1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert!(node.last_seen > registered.last_seen);
    }
}

#[tokio::test]
async fn rows_survive_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordination.db");

    // "Process A" writes.
    {
        let pool = storage::connect(path.to_str().unwrap()).await.unwrap();
        storage::run_migrations(&pool).await.unwrap();
        let registries = Registries::persistent(pool.clone());
        registries.users.register(sample_user("alice")).await.unwrap();
        registries
            .installations
            .store(sample_installation("user-alice", "tok"))
            .await
            .unwrap();
        registries
            .workspaces
            .create(sample_workspace("ws-1", "user-alice"))
            .await
            .unwrap();
        pool.close().await;
    }

    // "Process B" reads the same file.
    let pool = storage::connect(path.to_str().unwrap()).await.unwrap();
    storage::run_migrations(&pool).await.unwrap();
    let registries = Registries::persistent(pool);
    let user = registries.users.get("alice").await.unwrap();
    assert_eq!(user.user_id, "user-alice");
    let installation = registries.installations.get("user-alice").await.unwrap();
    assert_eq!(installation.token, "tok");
    let workspace = registries.workspaces.get("ws-1").await.unwrap();
    assert_eq!(workspace.workspace_name, "ws1");
}

#[tokio::test]
async fn deleting_a_workspace_deletes_its_services() {
    let dir = tempfile::tempdir().unwrap();
    let registries = persistent_registries(&dir).await;
    registries
        .workspaces
        .create(sample_workspace("ws-9", "u1"))
        .await
        .unwrap();
    registries
        .workspaces
        .replace_services("ws-9", vec![sample_service("ws-9", "web", 3000)])
        .await
        .unwrap();
    registries.workspaces.delete("ws-9").await.unwrap();
    let err = registries.workspaces.services("ws-9").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound));
}
