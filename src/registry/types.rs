//! Data types shared by the supervisor, cache, store and HTTP layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::{RegistryError, RegistryResult};

/// Executable plus argument list used to launch a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a named server.
///
/// `Absent` is never stored; a name without an entry is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Absent,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Read-only view of a supervised process. The process handle itself never
/// leaves the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(flatten)]
    pub launch: LaunchCommand,
    pub metadata_url: String,
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub state: ServerState,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// One capability advertised by a tool server, tagged with its owner.
///
/// Serializes flat: `{"name": .., "server": .., <descriptor fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub name: String,
    pub server: String,
    /// Remaining descriptor fields, kept verbatim.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl CapabilityRecord {
    /// Tag a raw manifest descriptor with its owning server.
    ///
    /// Any `server` field the tool server sent is overwritten.
    pub fn from_descriptor(server: &str, descriptor: Value) -> RegistryResult<Self> {
        let Value::Object(mut fields) = descriptor else {
            return Err(RegistryError::UpstreamMetadataError {
                name: server.to_string(),
                reason: "tool descriptor is not an object".to_string(),
            });
        };

        let name = match fields.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(RegistryError::UpstreamMetadataError {
                    name: server.to_string(),
                    reason: "tool descriptor has no string 'name'".to_string(),
                })
            }
        };
        fields.remove("server");

        Ok(Self {
            name,
            server: server.to_string(),
            metadata: fields,
        })
    }

    pub fn description(&self) -> Option<&str> {
        self.metadata.get("description").and_then(Value::as_str)
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.metadata
            .get("inputSchema")
            .or_else(|| self.metadata.get("input_schema"))
    }

    pub fn output_schema(&self) -> Option<&Value> {
        self.metadata
            .get("outputSchema")
            .or_else(|| self.metadata.get("output_schema"))
    }
}
