//! Gateway configuration.
//!
//! Everything is read from environment variables, with defaults suitable for
//! running a local gateway:
//! - `GATEWAY_HOST` / `GATEWAY_PORT` - bind address (`127.0.0.1:8000`)
//! - `GATEWAY_WORKING_DIR` - base directory for state (current directory)
//! - `GATEWAY_DATABASE_PATH` - SQLite file (`{working_dir}/.mcp-gateway/registry.db`)
//! - `GATEWAY_DEFAULT_METADATA_URL` - used when a start request omits `metadata_url`
//! - `GATEWAY_HEALTH_TIMEOUT_MS`, `GATEWAY_HEALTH_INTERVAL_MS`,
//!   `GATEWAY_HEALTH_REQUEST_TIMEOUT_MS`, `GATEWAY_STOP_GRACE_MS` - supervisor timing

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::registry::SupervisorConfig;

pub const DEFAULT_METADATA_URL: &str = "http://localhost:3333/metadata";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to determine working directory: {0}")]
    WorkingDir(#[from] std::io::Error),
}

/// Runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub working_dir: PathBuf,
    pub database_path: PathBuf,
    pub default_metadata_url: String,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let host = get("GATEWAY_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = match get("GATEWAY_PORT") {
            Some(value) => value.trim().parse().map_err(|e| ConfigError::Invalid {
                var: "GATEWAY_PORT",
                value: value.clone(),
                reason: format!("{}", e),
            })?,
            None => 8000,
        };

        let working_dir = match get("GATEWAY_WORKING_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };
        let database_path = get("GATEWAY_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| working_dir.join(".mcp-gateway").join("registry.db"));

        let default_metadata_url = get("GATEWAY_DEFAULT_METADATA_URL")
            .unwrap_or_else(|| DEFAULT_METADATA_URL.to_string());

        let defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            health_timeout: millis(&get, "GATEWAY_HEALTH_TIMEOUT_MS", defaults.health_timeout)?,
            health_interval: millis(&get, "GATEWAY_HEALTH_INTERVAL_MS", defaults.health_interval)?,
            request_timeout: millis(
                &get,
                "GATEWAY_HEALTH_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            )?,
            stop_grace: millis(&get, "GATEWAY_STOP_GRACE_MS", defaults.stop_grace)?,
        };

        Ok(Self {
            host,
            port,
            working_dir,
            database_path,
            default_metadata_url,
            supervisor,
        })
    }
}

/// Parse a positive millisecond duration, falling back to `default` when unset.
fn millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(var) else {
        return Ok(default);
    };
    let ms: u64 = value.trim().parse().map_err(|e| ConfigError::Invalid {
        var,
        value: value.clone(),
        reason: format!("{}", e),
    })?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("GATEWAY_WORKING_DIR", "/srv/gateway")]).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(
            config.database_path,
            PathBuf::from("/srv/gateway/.mcp-gateway/registry.db")
        );
        assert_eq!(config.default_metadata_url, DEFAULT_METADATA_URL);
        assert_eq!(config.supervisor.health_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("GATEWAY_PORT", "9100"),
            ("GATEWAY_DATABASE_PATH", "/tmp/reg.db"),
            ("GATEWAY_HEALTH_TIMEOUT_MS", "500"),
            ("GATEWAY_STOP_GRACE_MS", "100"),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.database_path, PathBuf::from("/tmp/reg.db"));
        assert_eq!(config.supervisor.health_timeout, Duration::from_millis(500));
        assert_eq!(config.supervisor.stop_grace, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("GATEWAY_PORT", "eighty")]),
            Err(ConfigError::Invalid { var: "GATEWAY_PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("GATEWAY_HEALTH_INTERVAL_MS", "0")]),
            Err(ConfigError::Invalid { var: "GATEWAY_HEALTH_INTERVAL_MS", .. })
        ));
    }
}
