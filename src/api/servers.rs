//! Tool server endpoints.
//!
//! - `POST /start_mcp_server/:server_name` - launch and register a tool server
//! - `GET /get_tools/:server_name` - capabilities from cache or store
//! - `POST /stop_mcp_server/:server_name` - stop a tool server
//! - `GET /servers` - list running tool servers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::registry::LaunchCommand;

use super::routes::AppState;
use super::types::*;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start_mcp_server/:server_name", post(start_server))
        .route("/get_tools/:server_name", get(get_tools))
        .route("/stop_mcp_server/:server_name", post(stop_server))
        .route("/servers", get(list_servers))
}

async fn start_server(
    State(state): State<Arc<AppState>>,
    Path(server_name): Path<String>,
    Json(req): Json<StartServerRequest>,
) -> Result<Json<StartServerResponse>, ApiError> {
    let metadata_url = req
        .metadata_url
        .unwrap_or_else(|| state.config.default_metadata_url.clone());
    let launch = LaunchCommand::new(req.command, req.args);

    let outcome = state
        .registry
        .start_server(&server_name, &launch, &metadata_url)
        .await
        .map_err(api_error)?;

    Ok(Json(StartServerResponse {
        message: format!("Started server '{}'", server_name),
        tools: outcome.tools.into_iter().map(|t| t.name).collect(),
    }))
}

async fn get_tools(
    State(state): State<Arc<AppState>>,
    Path(server_name): Path<String>,
) -> Result<Json<ToolsResponse>, ApiError> {
    let (tools, source) = state
        .registry
        .get_tools_with_source(&server_name)
        .await
        .map_err(api_error)?;

    tracing::debug!(server = %server_name, ?source, count = tools.len(), "Served tools");
    Ok(Json(ToolsResponse { tools }))
}

async fn stop_server(
    State(state): State<Arc<AppState>>,
    Path(server_name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .registry
        .stop_server(&server_name)
        .await
        .map_err(api_error)?;

    Ok(Json(MessageResponse {
        message: format!("Stopped server '{}'", server_name),
    }))
}

async fn list_servers(State(state): State<Arc<AppState>>) -> Json<ServersResponse> {
    Json(ServersResponse {
        servers: state.registry.list_servers(),
    })
}
