use axum::extract::Extension;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;
use crate::{events, middleware, nodes, oauth, services, users, workspaces};

async fn root() -> &'static str {
    "Nexus Coordination API"
}

/// `GET /health`
async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let storage = match &state.pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "ok",
            Err(_) => "unreachable",
        },
        None => "memory",
    };
    Json(json!({
        "status": "ok",
        "storage": storage,
        "timestamp": chrono::Utc::now(),
    }))
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(events::stream_events))
        .route(
            "/api/v1/nodes",
            get(nodes::list_nodes).post(nodes::register_node),
        )
        .route(
            "/api/v1/nodes/:id",
            get(nodes::get_node)
                .put(nodes::update_node)
                .delete(nodes::unregister_node),
        )
        .route("/api/v1/nodes/:id/status", get(nodes::node_status))
        .route("/api/v1/nodes/:id/heartbeat", post(nodes::heartbeat))
        .route("/api/v1/nodes/:id/commands", post(nodes::dispatch_command))
        .route(
            "/api/v1/commands/:id/result",
            post(nodes::report_command_result),
        )
        .route("/api/v1/services", get(services::list_services))
        .route(
            "/api/v1/users",
            get(users::list_users).post(users::register_user),
        )
        .route("/api/v1/users/register", post(users::register_user_github))
        .route(
            "/api/v1/users/:username",
            get(users::get_user).delete(users::delete_user),
        )
        .route("/api/v1/workspaces", get(workspaces::list_workspaces))
        .route(
            "/api/v1/workspaces/create-from-repo",
            post(workspaces::create_from_repo),
        )
        .route(
            "/api/v1/workspaces/:id",
            delete(workspaces::delete_workspace),
        )
        .route(
            "/api/v1/workspaces/:id/status",
            get(workspaces::workspace_status),
        )
        .route("/api/v1/workspaces/:id/stop", post(workspaces::stop_workspace))
        .route("/api/v1/workspaces/:id/users", get(workspaces::workspace_users))
        .route(
            "/api/v1/workspaces/:id/services",
            get(workspaces::workspace_services),
        )
        .route(
            "/auth/github/callback",
            get(oauth::callback).post(oauth::callback),
        )
        .route("/api/github/oauth-url", post(oauth::oauth_url))
        .route("/api/github/token", get(oauth::token_lookup))
        .route("/workspace/auth-success", get(oauth::auth_success_page))
        .route("/workspace/auth-error", get(oauth::auth_error_page))
}

/// Full application router with the middleware chain
/// CORS → auth → request-logging → handler.
pub fn app(state: AppState) -> Router {
    api_routes()
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(axum::middleware::from_fn(middleware::require_auth))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
