use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use httpmock::prelude::*;
use nexus_coordination::config::Config;
use nexus_coordination::github::GitHubClient;
use nexus_coordination::models::{User, Workspace, WorkspaceStatus};
use nexus_coordination::pipeline::{self, RequestedService};
use nexus_coordination::provider::{
    ExecOutput, ExecSpec, Provider, ProviderError, ProviderSession, WorkspaceConfig,
};
use nexus_coordination::AppState;

/// Records lifecycle calls and answers with fixed port mappings.
#[derive(Default)]
struct RecordingProvider {
    created: Mutex<Vec<String>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    execs: Mutex<Vec<String>>,
    mappings: HashMap<u16, u16>,
}

impl RecordingProvider {
    fn with_mappings(mappings: HashMap<u16, u16>) -> Self {
        Self {
            mappings,
            ..Default::default()
        }
    }

    fn exec_lines(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(
        &self,
        workspace_id: &str,
        _workspace_dir: &Path,
        _config: &WorkspaceConfig,
    ) -> Result<ProviderSession, ProviderError> {
        self.created.lock().unwrap().push(workspace_id.to_string());
        Ok(ProviderSession {
            id: format!("sess-{workspace_id}"),
        })
    }

    async fn start(&self, session_id: &str) -> Result<(), ProviderError> {
        self.started.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn exec(&self, _session_id: &str, spec: ExecSpec) -> Result<ExecOutput, ProviderError> {
        self.execs.lock().unwrap().push(spec.cmd.join(" "));
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stop(&self, session_id: &str) -> Result<(), ProviderError> {
        self.stopped.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn port_mappings(
        &self,
        _session_id: &str,
    ) -> Result<Option<HashMap<u16, u16>>, ProviderError> {
        Ok(Some(self.mappings.clone()))
    }
}

fn sample_workspace(id: &str) -> Workspace {
    let now = Utc::now();
    Workspace {
        workspace_id: id.to_string(),
        user_id: "alice".into(),
        workspace_name: "ws1".into(),
        status: WorkspaceStatus::Creating,
        provider: "docker".into(),
        image: "ubuntu:22.04".into(),
        repo_owner: "owner".into(),
        repo_name: "repo".into(),
        repo_url: "https://github.com/owner/repo.git".into(),
        branch: "main".into(),
        commit: None,
        is_fork: false,
        fork_url: None,
        ssh_host: Some("localhost".into()),
        ssh_port: Some(2230),
        node_id: None,
        created_at: now,
        updated_at: now,
    }
}

async fn seed_user(state: &AppState) {
    let now = Utc::now();
    state
        .registries
        .users
        .register(User {
            user_id: "alice".into(),
            github_username: "alice".into(),
            ssh_public_key: None,
            ssh_key_fingerprint: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn provisioning_registers_services_and_converges_to_running() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/alice.keys");
        then.status(200)
            .body("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMrZtVzRz1uN7PSS6nCFW45pJ3gebIiIWwoGc6A9AAAA alice@laptop\n");
    });

    let provider = Arc::new(RecordingProvider::with_mappings(HashMap::from([
        (3000, 23000),
        (22, 2250),
    ])));
    let mut state = AppState::ephemeral(Config::default());
    state.github = Arc::new(GitHubClient::new(
        server.base_url(),
        server.base_url(),
        "id",
        "secret",
        "http://localhost:8080/auth/github/callback",
    ));
    state.provider = Some(provider.clone());
    seed_user(&state).await;

    let workspace = sample_workspace("ws-pipeline");
    state
        .registries
        .workspaces
        .create(workspace.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    pipeline::provision_container(
        &state,
        &workspace,
        dir.path(),
        WorkspaceConfig::default(),
        vec![RequestedService {
            name: "web".into(),
            command: Some("npm start".into()),
            port: Some(3000),
            depends_on: vec![],
        }],
    )
    .await
    .unwrap();

    // Container lifecycle ran against the bound provider.
    assert_eq!(provider.created.lock().unwrap().as_slice(), ["ws-pipeline"]);
    assert_eq!(
        provider.started.lock().unwrap().as_slice(),
        ["sess-ws-pipeline"]
    );

    // Authorized keys were written and sshd configured inside the container.
    let execs = provider.exec_lines();
    assert!(execs.iter().any(|c| c.contains("authorized_keys")));
    assert!(execs.iter().any(|c| c.contains("openssh-server")));

    // The mapped service port landed in /etc/environment.
    assert!(
        execs
            .iter()
            .any(|c| c.contains("export NEXUS_SERVICE_WEB_PORT=23000")
                && c.contains("/etc/environment")),
        "execs: {execs:?}"
    );

    let workspace = state
        .registries
        .workspaces
        .get("ws-pipeline")
        .await
        .unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
    // Container port 22 was remapped, so the workspace follows it.
    assert_eq!(workspace.ssh_port, Some(2250));

    let services = state
        .registries
        .workspaces
        .services("ws-pipeline")
        .await
        .unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "web");
    assert_eq!(services[0].port, 3000);
    assert_eq!(services[0].local_port, Some(23000));
}

#[tokio::test]
async fn missing_github_keys_do_not_fail_the_pipeline() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/alice.keys");
        then.status(404);
    });

    let provider = Arc::new(RecordingProvider::default());
    let mut state = AppState::ephemeral(Config::default());
    state.github = Arc::new(GitHubClient::new(
        server.base_url(),
        server.base_url(),
        "id",
        "secret",
        "http://localhost:8080/auth/github/callback",
    ));
    state.provider = Some(provider.clone());
    seed_user(&state).await;

    let workspace = sample_workspace("ws-nokeys");
    state
        .registries
        .workspaces
        .create(workspace.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    pipeline::provision_container(&state, &workspace, dir.path(), WorkspaceConfig::default(), vec![])
        .await
        .unwrap();

    // No ssh setup commands ran, but the workspace still converged.
    assert!(provider.exec_lines().iter().all(|c| !c.contains("sshd")));
    let workspace = state.registries.workspaces.get("ws-nokeys").await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
}

#[tokio::test]
async fn provider_name_mismatch_fails_the_stage() {
    let provider = Arc::new(RecordingProvider::default());
    let mut state = AppState::ephemeral(Config::default());
    state.provider = Some(provider);
    seed_user(&state).await;

    let mut workspace = sample_workspace("ws-mismatch");
    workspace.provider = "qemu".into();
    state
        .registries
        .workspaces
        .create(workspace.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let err = pipeline::provision_container(
        &state,
        &workspace,
        dir.path(),
        WorkspaceConfig::default(),
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("provider"));
}

#[tokio::test]
async fn failed_clone_marks_the_workspace_error() {
    let mut state = AppState::ephemeral(Config::default());
    state.provider = Some(Arc::new(RecordingProvider::default()));
    state.workspace_root = tempfile::tempdir().unwrap().into_path();
    seed_user(&state).await;

    let mut workspace = sample_workspace("ws-badrepo");
    workspace.repo_url = "file:///nonexistent/definitely-missing.git".into();
    state
        .registries
        .workspaces
        .create(workspace.clone())
        .await
        .unwrap();

    pipeline::spawn(state.clone(), workspace, None, vec![]);

    let mut status = WorkspaceStatus::Creating;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = state
            .registries
            .workspaces
            .get("ws-badrepo")
            .await
            .unwrap()
            .status;
        if status == WorkspaceStatus::Error {
            break;
        }
    }
    assert_eq!(status, WorkspaceStatus::Error);
}
