//! Metadata endpoint client.
//!
//! A tool server answers `GET <metadata_url>` with `{"tools": [descriptor, ...]}`,
//! where every descriptor is an object with at least a string `name`.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

/// Why a single metadata fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No HTTP response at all (connection refused, timeout, DNS).
    Unreachable(String),
    /// An HTTP response arrived but was not a usable manifest.
    BadResponse(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            Self::BadResponse(reason) => write!(f, "bad response: {}", reason),
        }
    }
}

/// HTTP client used to pull manifests from tool servers.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: Client,
}

impl MetadataClient {
    /// Create a client whose individual requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build metadata client, using defaults: {}", e);
                Client::new()
            });
        Self { client }
    }

    /// Fetch and parse the manifest once.
    pub async fn fetch(&self, url: &str) -> Result<Vec<Value>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::BadResponse(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::BadResponse(format!("{} - {}", status, text)));
        }

        parse_manifest(&text).map_err(FetchError::BadResponse)
    }
}

/// Parse a manifest body into its raw descriptors.
///
/// A missing `tools` field is an empty manifest.
pub fn parse_manifest(body: &str) -> Result<Vec<Value>, String> {
    let doc: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {}", e))?;
    let Value::Object(mut doc) = doc else {
        return Err("manifest is not a JSON object".to_string());
    };

    let tools = match doc.remove("tools") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(tools)) => tools,
        Some(_) => return Err("'tools' is not an array".to_string()),
    };

    for (idx, tool) in tools.iter().enumerate() {
        let has_name = tool
            .get("name")
            .and_then(Value::as_str)
            .map(|n| !n.is_empty())
            .unwrap_or(false);
        if !has_name {
            return Err(format!("tool #{} has no string 'name'", idx));
        }
    }

    Ok(tools)
}
