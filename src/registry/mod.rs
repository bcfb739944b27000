//! Tool server registry.
//!
//! This module handles:
//! - Spawning tool server processes and health-gating them on their metadata endpoint
//! - Caching each running server's capability manifest in memory
//! - Persisting capability records (deduplicated on `(name, server)`) in SQLite
//! - Answering capability queries from cache, falling back to the store

mod cache;
mod errors;
mod manifest;
mod service;
mod store;
mod supervisor;
mod types;

pub use cache::CapabilityCache;
pub use errors::{RegistryError, RegistryResult};
pub use manifest::{parse_manifest, FetchError, MetadataClient};
pub use service::{StartOutcome, ToolRegistry, ToolSource};
pub use store::{CapabilityStore, SqliteCapabilityStore};
pub use supervisor::{ProcessSupervisor, StartedServer, SupervisorConfig};
pub use types::{CapabilityRecord, LaunchCommand, ServerInfo, ServerState};

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::Value;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/metadata", addr)
    }

    /// Metadata endpoint that always answers with `manifest`.
    pub async fn metadata_stub(manifest: Value) -> String {
        let app = Router::new().route(
            "/metadata",
            get(move || {
                let manifest = manifest.clone();
                async move { Json(manifest) }
            }),
        );
        serve(app).await
    }

    /// Metadata endpoint that always answers with a bare status code.
    pub async fn status_stub(status: u16) -> String {
        let status = StatusCode::from_u16(status).unwrap();
        let app = Router::new().route("/metadata", get(move || async move { status }));
        serve(app).await
    }

    /// A metadata URL on a loopback port nobody listens on.
    pub fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/metadata", port)
    }

    /// True if `pid` exists and is not a zombie waiting to be reaped.
    pub fn pid_alive(pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Field 3, after the parenthesised command name, is the state.
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    /// Wait up to two seconds for `pid` to die. Orphaned grandchildren are
    /// reaped by init, which can lag behind the kill.
    pub async fn wait_for_exit(pid: i32) -> bool {
        for _ in 0..40 {
            if !pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        !pid_alive(pid)
    }

    /// Read a pid written by a launched shell script, waiting for the write.
    pub async fn read_pid(path: &std::path::Path) -> i32 {
        for _ in 0..40 {
            if let Ok(pid) = std::fs::read_to_string(path)
                .unwrap_or_default()
                .trim()
                .parse()
            {
                return pid;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("no pid written to {}", path.display());
    }
}
