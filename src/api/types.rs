//! API request and response types.

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::registry::{CapabilityRecord, RegistryError, ServerInfo};

/// Body of `POST /start_mcp_server/{server_name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartServerRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to the gateway's configured metadata URL.
    #[serde(default)]
    pub metadata_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartServerResponse {
    pub message: String,
    /// Capability names, in manifest order.
    pub tools: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolsResponse {
    pub tools: Vec<CapabilityRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ServersResponse {
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub running_servers: usize,
}

/// Error body, shaped `{"detail": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a registry error onto its HTTP status.
pub fn api_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::AlreadyRunning { .. } | RegistryError::InvalidRequest { .. } => {
            StatusCode::BAD_REQUEST
        }
        RegistryError::NotRunning { .. } | RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::HealthCheckTimeout { .. }
        | RegistryError::UpstreamMetadataError { .. }
        | RegistryError::SpawnError { .. }
        | RegistryError::ProcessExited { .. }
        | RegistryError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            detail: e.to_string(),
        }),
    )
}
