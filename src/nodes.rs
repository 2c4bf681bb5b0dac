use std::collections::HashMap;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::{Event, EventType};
use crate::models::{CapabilityInput, Command, CommandResult, CommandStatus, Node, NodeStatus};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterNodeRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub capabilities: Option<CapabilityInput>,
    #[serde(default)]
    pub services: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

/// `POST /api/v1/nodes`
pub async fn register_node(
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterNodeRequest>,
) -> AppResult<(StatusCode, Json<Node>)> {
    let mut missing = Vec::new();
    if payload.id.as_deref().unwrap_or("").is_empty() {
        missing.push("id");
    }
    if payload.name.as_deref().unwrap_or("").is_empty() {
        missing.push("name");
    }
    if payload.provider.as_deref().unwrap_or("").is_empty() {
        missing.push("provider");
    }
    if payload.address.as_deref().unwrap_or("").is_empty() {
        missing.push("address");
    }
    if !missing.is_empty() {
        return Err(AppError::MissingFields(missing));
    }

    let now = Utc::now();
    let node = Node {
        id: payload.id.unwrap(),
        name: payload.name.unwrap(),
        provider: payload.provider.unwrap(),
        status: payload.status.unwrap_or(NodeStatus::Active),
        address: payload.address.unwrap(),
        port: payload.port.unwrap_or(8080),
        labels: payload.labels.unwrap_or_default(),
        capabilities: payload
            .capabilities
            .map(CapabilityInput::into_map)
            .unwrap_or_default(),
        services: payload.services,
        metadata: payload.metadata.unwrap_or_default(),
        created_at: now,
        updated_at: now,
        last_seen: now,
    };
    let node = state.registries.nodes.register(node).await?;
    state
        .broadcaster
        .publish(Event::new(EventType::NodeRegistered, json!({ "node": node })));
    Ok((StatusCode::CREATED, Json(node)))
}

/// `GET /api/v1/nodes`
pub async fn list_nodes(Extension(state): Extension<AppState>) -> AppResult<Json<Value>> {
    let nodes = state.registries.nodes.list().await?;
    Ok(Json(json!({ "count": nodes.len(), "nodes": nodes })))
}

/// `GET /api/v1/nodes/:id`
pub async fn get_node(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Node>> {
    Ok(Json(state.registries.nodes.get(&id).await?))
}

/// `PUT /api/v1/nodes/:id` — opaque field map; unknown fields ignored.
pub async fn update_node(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<HashMap<String, Value>>,
) -> AppResult<Json<Node>> {
    let node = state.registries.nodes.update(&id, fields).await?;
    state
        .broadcaster
        .publish(Event::new(EventType::NodeUpdated, json!({ "node": node })));
    Ok(Json(node))
}

/// `DELETE /api/v1/nodes/:id`
pub async fn unregister_node(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    state.registries.nodes.unregister(&id).await?;
    state.broadcaster.publish(Event::new(
        EventType::NodeUnregistered,
        json!({ "node_id": id }),
    ));
    Ok(Json(json!({ "status": "unregistered", "node_id": id })))
}

/// `GET /api/v1/nodes/:id/status`
pub async fn node_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let node = state.registries.nodes.get(&id).await?;
    Ok(Json(json!({
        "id": node.id,
        "status": node.status,
        "last_seen": node.last_seen,
    })))
}

#[derive(Deserialize, Default)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

/// `POST /api/v1/nodes/:id/heartbeat`
pub async fn heartbeat(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<HeartbeatRequest>>,
) -> AppResult<Json<Value>> {
    let status = payload.and_then(|Json(p)| p.status);
    state.registries.nodes.heartbeat(&id, status).await?;
    Ok(Json(json!({ "status": "ok", "node_id": id })))
}

#[derive(Deserialize)]
pub struct DispatchCommandRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: Option<String>,
    pub action: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    pub timeout_seconds: Option<u64>,
    pub user: Option<String>,
}

/// `POST /api/v1/nodes/:id/commands`
///
/// Without an attached dispatcher this simulates a success result (kept for
/// agents that only consume the event stream); a dispatcher plugs in real
/// routing without changing the endpoint.
pub async fn dispatch_command(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<DispatchCommandRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let node = state.registries.nodes.get(&id).await?;
    let action = payload
        .action
        .filter(|a| !a.is_empty())
        .ok_or(AppError::MissingFields(vec!["action"]))?;

    let command = Command {
        id: payload
            .id
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        command_type: payload.command_type.unwrap_or_else(|| "exec".into()),
        node_id: node.id.clone(),
        action: action.clone(),
        params: payload.params.unwrap_or(Value::Null),
        timeout_seconds: payload.timeout_seconds,
        user: payload.user,
        created_at: Utc::now(),
    };

    let result = match &state.dispatcher {
        Some(dispatcher) => dispatcher.dispatch(&node, &command).await?,
        None => CommandResult {
            command_id: command.id.clone(),
            status: CommandStatus::Success,
            output: format!("simulated execution of {action} on {}", node.id),
            error: None,
            duration_ms: 0,
            finished_at: Utc::now(),
        },
    };
    let _ = state.command_tx.send(result).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "command_id": command.id, "status": "dispatched" })),
    ))
}

/// `POST /api/v1/commands/:id/result` — agent-reported outcome.
pub async fn report_command_result(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(result): Json<CommandResult>,
) -> AppResult<Json<Value>> {
    if result.command_id != id {
        return Err(AppError::Validation(format!(
            "result command_id {} does not match path id {id}",
            result.command_id
        )));
    }
    let _ = state.command_tx.send(result).await;
    Ok(Json(json!({ "status": "accepted", "command_id": id })))
}
