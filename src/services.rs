use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::error::AppResult;
use crate::state::AppState;

/// `GET /api/v1/services` — the service maps of every registered node,
/// keyed by node id.
pub async fn list_services(Extension(state): Extension<AppState>) -> AppResult<Json<Value>> {
    let nodes = state.registries.nodes.list().await?;
    let mut services = Map::new();
    let mut count = 0usize;
    for node in nodes {
        if let Some(map) = node.services {
            count += map.len();
            services.insert(node.id, json!(map));
        }
    }
    Ok(Json(json!({ "count": count, "services": services })))
}
