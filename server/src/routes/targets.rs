//! Command layer: discovery and proxy start/stop.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::TargetList;
use crate::error::ProxyError;
use crate::sessions::ProxyInfo;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    /// Debug socket name, including the leading `@`.
    pub name: String,
    /// Local port to forward through. Absent or 0 picks one from the bind range.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct UnproxyRequest {
    pub name: String,
}

/// `GET /api/targets`
pub async fn list(State(state): State<AppState>) -> Result<Json<TargetList>, ProxyError> {
    Ok(Json(state.engine.list_targets().await?))
}

/// `POST /api/targets/proxy`
pub async fn proxy(
    State(state): State<AppState>,
    Json(req): Json<ProxyRequest>,
) -> Result<Json<ProxyInfo>, ProxyError> {
    let info = state.engine.start_proxy(&req.name, req.port).await?;
    Ok(Json(info))
}

/// `POST /api/targets/unproxy`
pub async fn unproxy(
    State(state): State<AppState>,
    Json(req): Json<UnproxyRequest>,
) -> Result<Json<Value>, ProxyError> {
    state.engine.stop_proxy(&req.name).await?;
    Ok(Json(json!({"stopped": req.name})))
}
