use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use httpmock::prelude::*;
use hyper::body::to_bytes;
use nexus_coordination::config::Config;
use nexus_coordination::github::GitHubClient;
use nexus_coordination::routes;
use nexus_coordination::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

fn state_with_mock(server: &MockServer) -> AppState {
    let mut state = AppState::ephemeral(Config::default());
    state.github = Arc::new(GitHubClient::new(
        server.base_url(),
        server.base_url(),
        "client-id",
        "client-secret",
        "http://localhost:8080/auth/github/callback",
    ));
    // Background pipelines spawned by create-from-repo clone under here.
    state.workspace_root = tempfile::tempdir().unwrap().into_path();
    state
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn issue_state(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/github/oauth-url",
            json!({"repo_full_name": "owner/repo"}),
        ))
        .await
        .unwrap();
    body_json(response).await["state"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn callback_exchanges_code_and_stores_installation() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login/oauth/access_token");
        then.status(200).json_body(json!({
            "access_token": "gho_test_token",
            "token_type": "bearer",
            "scope": "repo",
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/user");
        then.status(200).json_body(json!({ "id": 77, "login": "alice" }));
    });

    let state = state_with_mock(&server);
    let app = routes::app(state.clone());
    let csrf = issue_state(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/auth/github/callback?code=abc&state={csrf}"))
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["status"], "authorized");

    // The user was auto-created and the installation persisted.
    let user = state.registries.users.get("alice").await.unwrap();
    assert_eq!(user.user_id, "alice");
    let installation = state.registries.installations.get("alice").await.unwrap();
    assert_eq!(installation.token, "gho_test_token");
    assert_eq!(installation.github_user_id, 77);
    assert_eq!(installation.repo_full_name.as_deref(), Some("owner/repo"));

    // A consumed state token cannot be replayed.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/auth/github/callback?code=abc&state={csrf}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_without_json_accept_redirects_to_success_page() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login/oauth/access_token");
        then.status(200).json_body(json!({ "access_token": "tok", "token_type": "bearer" }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/user");
        then.status(200).json_body(json!({ "id": 5, "login": "bob" }));
    });

    let state = state_with_mock(&server);
    let app = routes::app(state);
    let csrf = issue_state(&app).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/auth/github/callback?code=abc&state={csrf}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(location, "/workspace/auth-success?user=bob");
}

#[tokio::test]
async fn failed_exchange_reports_exchange_failed() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login/oauth/access_token");
        then.status(502);
    });

    let state = state_with_mock(&server);
    let app = routes::app(state);
    let csrf = issue_state(&app).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/auth/github/callback?code=abc&state={csrf}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["status"], "exchange_failed");
}

async fn register_alice_with_installation(state: &AppState, app: &axum::Router) {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/users/register",
            json!({"github_username": "alice"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let user_id = body["user_id"].as_str().unwrap().to_string();

    state
        .registries
        .installations
        .store(nexus_coordination::models::GitHubInstallation {
            installation_id: 0,
            user_id,
            github_user_id: 77,
            github_username: "alice".into(),
            repo_full_name: Some("owner/repo".into()),
            token: "gho_test_token".into(),
            token_expires_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn create_from_repo_accepts_and_reports_creating() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/repos/owner/repo");
        then.status(200).json_body(json!({
            "private": false,
            "owner": { "id": 1, "login": "owner" },
            "name": "repo",
            "clone_url": "https://github.com/owner/repo.git",
            "default_branch": "main",
        }));
    });

    let state = state_with_mock(&server);
    let app = routes::app(state.clone());
    register_alice_with_installation(&state, &app).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v1/workspaces/create-from-repo",
            json!({
                "github_username": "alice",
                "workspace_name": "ws1",
                "repo": {
                    "owner": "owner",
                    "name": "repo",
                    "url": "https://github.com/owner/repo.git",
                    "branch": "main",
                },
                "provider": "docker",
                "image": "ubuntu:22.04",
                "services": [{"name": "web", "command": "npm start", "port": 3000}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "creating");
    let ssh_port = body["ssh_port"].as_u64().unwrap();
    assert!((2222..=2321).contains(&ssh_port), "ssh_port = {ssh_port}");
    let workspace_id = body["workspace_id"].as_str().unwrap();
    assert!(workspace_id.starts_with("ws-"));
    assert_eq!(
        body["polling_url"],
        format!("/api/v1/workspaces/{workspace_id}/status")
    );
    assert_eq!(body["estimated_time_seconds"], 60);
    assert_eq!(body["fork_created"], json!(false));

    // The row was persisted before the handler answered; the background
    // pipeline owns its status from here on.
    let workspace = state.registries.workspaces.get(workspace_id).await.unwrap();
    assert_eq!(workspace.workspace_name, "ws1");
    assert_eq!(workspace.repo_owner, "owner");
    assert_eq!(workspace.ssh_port, Some(ssh_port as u16));
}

#[tokio::test]
async fn private_foreign_repo_is_auto_forked() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/repos/owner/secret");
        then.status(200).json_body(json!({
            "private": true,
            "owner": { "id": 1, "login": "owner" },
            "name": "secret",
            "clone_url": "https://github.com/owner/secret.git",
        }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/repos/owner/secret/forks");
        then.status(202).json_body(json!({
            "full_name": "alice/secret",
            "owner": { "id": 77, "login": "alice" },
            "name": "secret",
            "clone_url": "https://github.com/alice/secret.git",
            "html_url": "https://github.com/alice/secret",
        }));
    });

    let state = state_with_mock(&server);
    let app = routes::app(state.clone());
    register_alice_with_installation(&state, &app).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v1/workspaces/create-from-repo",
            json!({
                "github_username": "alice",
                "workspace_name": "ws1",
                "repo": {"owner": "owner", "name": "secret", "url": "https://github.com/owner/secret.git"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["fork_created"], json!(true));
    assert_eq!(body["fork_url"], "https://github.com/alice/secret");

    let workspace_id = body["workspace_id"].as_str().unwrap();
    let workspace = state.registries.workspaces.get(workspace_id).await.unwrap();
    assert_eq!(workspace.repo_owner, "alice");
    assert_eq!(workspace.repo_url, "https://github.com/alice/secret.git");

    let user = state.registries.users.get("alice").await.unwrap();
    let forks = state
        .registries
        .forks
        .list_for_user(&user.user_id)
        .await
        .unwrap();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0].original_owner, "owner");
    assert_eq!(forks[0].fork_owner, "alice");
}

#[tokio::test]
async fn fork_failure_downgrades_to_original_repo() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/repos/owner/secret");
        then.status(200).json_body(json!({
            "private": true,
            "owner": { "id": 1, "login": "owner" },
            "name": "secret",
            "clone_url": "https://github.com/owner/secret.git",
        }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/repos/owner/secret/forks");
        then.status(403);
    });

    let state = state_with_mock(&server);
    let app = routes::app(state.clone());
    register_alice_with_installation(&state, &app).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v1/workspaces/create-from-repo",
            json!({
                "github_username": "alice",
                "workspace_name": "ws1",
                "repo": {"owner": "owner", "name": "secret", "url": "https://github.com/owner/secret.git"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["fork_created"], json!(false));

    let workspace_id = body["workspace_id"].as_str().unwrap();
    let workspace = state.registries.workspaces.get(workspace_id).await.unwrap();
    assert_eq!(workspace.repo_owner, "owner");
}

#[tokio::test]
async fn parallel_creates_get_distinct_workspace_ids() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/repos/owner/repo");
        then.status(200).json_body(json!({
            "private": false,
            "owner": { "id": 1, "login": "owner" },
            "name": "repo",
            "clone_url": "https://github.com/owner/repo.git",
        }));
    });

    let state = state_with_mock(&server);
    let app = routes::app(state.clone());
    register_alice_with_installation(&state, &app).await;

    let payload = json!({
        "github_username": "alice",
        "workspace_name": "ws1",
        "repo": {"owner": "owner", "name": "repo", "url": "https://github.com/owner/repo.git"},
    });
    let responses = futures_util::future::join_all((0..3).map(|_| {
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/workspaces/create-from-repo",
                payload.clone(),
            ))
    }))
    .await;

    let mut ids = Vec::new();
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        ids.push(
            body_json(response).await["workspace_id"]
                .as_str()
                .unwrap()
                .to_string(),
        );
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "workspace ids must be distinct");
}
