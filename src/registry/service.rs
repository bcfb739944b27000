//! Tool registry service: supervisor + cache + durable store.
//!
//! `start_server` and `stop_server` hold a per-name lock for their whole
//! duration, so process state, cache entry and store rows for one name change
//! as a unit. Different names never contend on that lock, and a name's lock
//! entry is dropped as soon as no call holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::cache::CapabilityCache;
use super::errors::{RegistryError, RegistryResult};
use super::store::CapabilityStore;
use super::supervisor::{ProcessSupervisor, SupervisorConfig};
use super::types::{CapabilityRecord, LaunchCommand, ServerInfo, ServerState};

/// Where a `get_tools` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Cache,
    Store,
}

/// Outcome of a successful `start_server`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub server: ServerInfo,
    pub tools: Vec<CapabilityRecord>,
    /// How many records were new to the durable store.
    pub newly_stored: usize,
}

type NameLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

fn lock_names(locks: &NameLocks) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A per-name lock, held or about to be.
///
/// On drop the map entry is removed if this was its last user.
struct NameLock<'a> {
    locks: &'a NameLocks,
    name: &'a str,
    lock: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameLock<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = lock_names(self.locks);
        // One reference in the map, one in `self.lock`.
        if locks
            .get(self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(self.name);
        }
    }
}

/// Aborts a freshly started server unless disarmed.
///
/// Covers a `start_server` future dropped between a healthy start and the
/// cache update.
struct StartRollback<'a> {
    supervisor: &'a ProcessSupervisor,
    name: &'a str,
    armed: bool,
}

impl StartRollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartRollback<'_> {
    fn drop(&mut self) {
        if self.armed && self.supervisor.abort(self.name) {
            tracing::warn!(server = self.name, "Start abandoned, process killed");
        }
    }
}

/// Registry of supervised tool servers and their capabilities.
pub struct ToolRegistry {
    supervisor: ProcessSupervisor,
    cache: CapabilityCache,
    store: Arc<dyn CapabilityStore>,
    name_locks: NameLocks,
}

impl ToolRegistry {
    pub fn new(config: SupervisorConfig, store: Arc<dyn CapabilityStore>) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            cache: CapabilityCache::new(),
            store,
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    fn name_lock<'a>(&'a self, name: &'a str) -> NameLock<'a> {
        let lock = Arc::clone(
            lock_names(&self.name_locks)
                .entry(name.to_string())
                .or_default(),
        );
        NameLock {
            locks: &self.name_locks,
            name,
            lock,
            held: None,
        }
    }

    /// Lock `name` for a start. A start or stop already in flight means the
    /// name has an entry, which is reported as `AlreadyRunning`.
    fn try_lock_for_start<'a>(&'a self, name: &'a str) -> RegistryResult<NameLock<'a>> {
        let mut lock = self.name_lock(name);
        let held = Arc::clone(&lock.lock).try_lock_owned().map_err(|_| {
            RegistryError::AlreadyRunning {
                name: name.to_string(),
            }
        })?;
        lock.held = Some(held);
        Ok(lock)
    }

    async fn lock_for_stop<'a>(&'a self, name: &'a str) -> NameLock<'a> {
        let mut lock = self.name_lock(name);
        lock.held = Some(Arc::clone(&lock.lock).lock_owned().await);
        lock
    }

    /// Launch a tool server, then cache and persist its capabilities.
    ///
    /// If persisting fails the fresh process is stopped again, so a failed
    /// start leaves neither a process nor a cache entry behind. If the call
    /// is dropped after the process came up but before its capabilities are
    /// cached, the process group is killed. Store rows already committed by
    /// then are kept.
    pub async fn start_server(
        &self,
        name: &str,
        launch: &LaunchCommand,
        metadata_url: &str,
    ) -> RegistryResult<StartOutcome> {
        validate_server_name(name)?;
        if launch.command.trim().is_empty() {
            return Err(RegistryError::InvalidRequest {
                reason: "command must not be empty".to_string(),
            });
        }
        validate_metadata_url(metadata_url)?;

        let _lock = self.try_lock_for_start(name)?;
        let started = self.supervisor.start(name, launch, metadata_url).await?;
        let rollback = StartRollback {
            supervisor: &self.supervisor,
            name,
            armed: true,
        };

        let tools = match tag_descriptors(name, started.manifest) {
            Ok(tools) => tools,
            Err(e) => {
                self.rollback_start(name).await;
                return Err(e);
            }
        };

        let newly_stored = match self.store.insert_if_absent(&tools).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(server = name, "Failed to persist capabilities: {}", e);
                self.rollback_start(name).await;
                return Err(e);
            }
        };

        self.cache.replace(name, tools.clone()).await;
        rollback.disarm();
        tracing::info!(
            server = name,
            tools = tools.len(),
            newly_stored,
            "Registered tool server capabilities"
        );

        Ok(StartOutcome {
            server: started.info,
            tools,
            newly_stored,
        })
    }

    async fn rollback_start(&self, name: &str) {
        if let Err(e) = self.supervisor.stop(name).await {
            tracing::warn!(server = name, "Rollback of failed start: {}", e);
        }
    }

    /// Capabilities for `name`: the cache entry if one exists (even an empty
    /// or stale one), otherwise whatever the store holds.
    pub async fn get_tools(&self, name: &str) -> RegistryResult<Vec<CapabilityRecord>> {
        self.get_tools_with_source(name).await.map(|(tools, _)| tools)
    }

    pub async fn get_tools_with_source(
        &self,
        name: &str,
    ) -> RegistryResult<(Vec<CapabilityRecord>, ToolSource)> {
        if let Some(cached) = self.cache.get(name).await {
            return Ok((cached.to_vec(), ToolSource::Cache));
        }

        let stored = self.store.list_by_server(name).await?;
        if stored.is_empty() {
            return Err(RegistryError::NotFound {
                name: name.to_string(),
            });
        }
        Ok((stored, ToolSource::Store))
    }

    /// Stop a tool server and evict its cache entry. Store rows are kept.
    ///
    /// A stop that races an in-flight start waits for the start to finish.
    /// A name with no entry fails with `NotRunning` without taking the lock.
    pub async fn stop_server(&self, name: &str) -> RegistryResult<ServerInfo> {
        if self.supervisor.state(name) == ServerState::Absent {
            return Err(RegistryError::NotRunning {
                name: name.to_string(),
            });
        }
        let _lock = self.lock_for_stop(name).await;

        let info = self.supervisor.stop(name).await?;
        self.cache.evict(name).await;
        Ok(info)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.supervisor.is_running(name)
    }

    pub fn state(&self, name: &str) -> ServerState {
        self.supervisor.state(name)
    }

    pub fn list_servers(&self) -> Vec<ServerInfo> {
        self.supervisor.list()
    }

    pub fn running_count(&self) -> usize {
        self.supervisor.running_count()
    }

    /// Stop every supervised process and drop all cached manifests.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
        self.cache.clear().await;
    }
}

fn tag_descriptors(
    server: &str,
    manifest: Vec<serde_json::Value>,
) -> RegistryResult<Vec<CapabilityRecord>> {
    manifest
        .into_iter()
        .map(|descriptor| CapabilityRecord::from_descriptor(server, descriptor))
        .collect()
}

fn validate_server_name(name: &str) -> RegistryResult<()> {
    if name.trim().is_empty() {
        return Err(RegistryError::InvalidRequest {
            reason: "server name must not be empty".to_string(),
        });
    }
    if name.contains('/') {
        return Err(RegistryError::InvalidRequest {
            reason: format!("server name '{}' must not contain '/'", name),
        });
    }
    Ok(())
}

fn validate_metadata_url(metadata_url: &str) -> RegistryResult<()> {
    let url = url::Url::parse(metadata_url).map_err(|e| RegistryError::InvalidRequest {
        reason: format!("invalid metadata_url '{}': {}", metadata_url, e),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(RegistryError::InvalidRequest {
            reason: format!("metadata_url scheme '{}' is not http(s)", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::SqliteCapabilityStore;
    use crate::registry::test_support::{
        closed_port_url, metadata_stub, read_pid, wait_for_exit,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn config(health_timeout: Duration) -> SupervisorConfig {
        SupervisorConfig {
            health_timeout,
            health_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
        }
    }

    fn registry() -> (ToolRegistry, Arc<SqliteCapabilityStore>) {
        let store = Arc::new(SqliteCapabilityStore::open_in_memory().unwrap());
        let config = config(Duration::from_millis(600));
        (ToolRegistry::new(config, store.clone()), store)
    }

    fn lock_count(registry: &ToolRegistry) -> usize {
        lock_names(&registry.name_locks).len()
    }

    /// A store whose writes never complete.
    struct StalledStore;

    #[async_trait]
    impl CapabilityStore for StalledStore {
        async fn insert_if_absent(&self, _records: &[CapabilityRecord]) -> RegistryResult<usize> {
            std::future::pending().await
        }

        async fn list_by_server(&self, _server: &str) -> RegistryResult<Vec<CapabilityRecord>> {
            Ok(Vec::new())
        }
    }

    fn sleeper() -> LaunchCommand {
        LaunchCommand::new("sleep", vec!["30".to_string()])
    }

    #[tokio::test]
    async fn test_start_query_stop_query() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let (registry, _) = registry();

        let outcome = registry
            .start_server("echo-tools", &sleeper(), &url)
            .await
            .unwrap();
        assert_eq!(outcome.newly_stored, 1);

        let expected = json!([{"name": "ping", "server": "echo-tools"}]);
        let (tools, source) = registry.get_tools_with_source("echo-tools").await.unwrap();
        assert_eq!(source, ToolSource::Cache);
        assert_eq!(serde_json::to_value(&tools).unwrap(), expected);

        registry.stop_server("echo-tools").await.unwrap();
        assert!(!registry.is_running("echo-tools"));

        let (tools, source) = registry.get_tools_with_source("echo-tools").await.unwrap();
        assert_eq!(source, ToolSource::Store);
        assert_eq!(serde_json::to_value(&tools).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_store_rows() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}, {"name": "echo"}]})).await;
        let (registry, store) = registry();

        registry.start_server("s", &sleeper(), &url).await.unwrap();
        registry.stop_server("s").await.unwrap();
        let second = registry.start_server("s", &sleeper(), &url).await.unwrap();
        assert_eq!(second.newly_stored, 0);

        assert_eq!(store.list_by_server("s").await.unwrap().len(), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_shadows_store() {
        let url = metadata_stub(json!({"tools": [{"name": "fresh"}]})).await;
        let (registry, store) = registry();
        store
            .insert_if_absent(&[CapabilityRecord::from_descriptor("s", json!({"name": "old"})).unwrap()])
            .await
            .unwrap();

        registry.start_server("s", &sleeper(), &url).await.unwrap();
        let names: Vec<String> = registry
            .get_tools("s")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["fresh".to_string()]);

        registry.stop_server("s").await.unwrap();
        let names: Vec<String> = registry
            .get_tools("s")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["old".to_string(), "fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_manifest_is_served_from_cache() {
        let url = metadata_stub(json!({"tools": []})).await;
        let (registry, _) = registry();

        registry.start_server("bare", &sleeper(), &url).await.unwrap();
        let (tools, source) = registry.get_tools_with_source("bare").await.unwrap();
        assert!(tools.is_empty());
        assert_eq!(source, ToolSource::Cache);

        registry.stop_server("bare").await.unwrap();
        let err = registry.get_tools("bare").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_server_not_found() {
        let (registry, _) = registry();
        let err = registry.get_tools("nobody").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        let err = registry.stop_server("nobody").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_nothing_behind() {
        let (registry, store) = registry();

        let err = registry
            .start_server("slow", &sleeper(), &closed_port_url())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::HealthCheckTimeout { .. }));
        assert_eq!(registry.state("slow"), ServerState::Absent);
        assert!(store.list_by_server("slow").await.unwrap().is_empty());
        assert!(matches!(
            registry.get_tools("slow").await.unwrap_err(),
            RegistryError::NotFound { .. }
        ));

        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        registry.start_server("slow", &sleeper(), &url).await.unwrap();
        assert!(registry.is_running("slow"));
        registry.shutdown().await;
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_start() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let (registry, _) = registry();
        let launch = sleeper();

        let (started, stopped) = tokio::join!(
            registry.start_server("s", &launch, &url),
            registry.stop_server("s")
        );
        started.unwrap();
        stopped.unwrap();
        assert!(!registry.is_running("s"));
        assert_eq!(registry.get_tools_with_source("s").await.unwrap().1, ToolSource::Store);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let (registry, _) = registry();
        let url = "http://127.0.0.1:1/metadata";

        for (name, launch, url) in [
            ("", sleeper(), url),
            ("a/b", sleeper(), url),
            ("ok", LaunchCommand::new(" ", Vec::new()), url),
            ("ok", sleeper(), "not a url"),
            ("ok", sleeper(), "ftp://127.0.0.1/metadata"),
        ] {
            let err = registry.start_server(name, &launch, url).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidRequest { .. }), "{name} {url}");
        }
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_start_does_not_block_other_names() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let store = Arc::new(SqliteCapabilityStore::open_in_memory().unwrap());
        let registry = ToolRegistry::new(config(Duration::from_secs(3)), store);

        let (slow_cmd, slow_url) = (sleeper(), closed_port_url());
        let slow = registry.start_server("slow", &slow_cmd, &slow_url);
        let other = async {
            let begun = Instant::now();
            registry.start_server("fast", &sleeper(), &url).await.unwrap();
            assert!(registry.is_running("fast"));
            registry.stop_server("fast").await.unwrap();
            begun.elapsed()
        };
        let (slow, elapsed) = tokio::join!(slow, other);

        assert!(matches!(slow.unwrap_err(), RegistryError::HealthCheckTimeout { .. }));
        assert!(elapsed < Duration::from_secs(2), "other name waited {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_start_while_polling_is_already_running() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let (registry, _) = registry();

        let (first_cmd, first_url) = (sleeper(), closed_port_url());
        let first = registry.start_server("s", &first_cmd, &first_url);
        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(registry.state("s"), ServerState::Starting);
            registry.start_server("s", &sleeper(), &url).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first.unwrap_err(), RegistryError::HealthCheckTimeout { .. }));
        assert!(matches!(second.unwrap_err(), RegistryError::AlreadyRunning { .. }));
        assert_eq!(registry.state("s"), ServerState::Absent);
    }

    #[tokio::test]
    async fn test_name_locks_do_not_accumulate() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let (registry, _) = registry();

        for i in 0..1000 {
            let err = registry.stop_server(&format!("ghost-{i}")).await.unwrap_err();
            assert!(matches!(err, RegistryError::NotRunning { .. }));
        }
        assert_eq!(lock_count(&registry), 0);

        registry.start_server("s", &sleeper(), &url).await.unwrap();
        assert_eq!(lock_count(&registry), 0);
        let err = registry.start_server("s", &sleeper(), &url).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRunning { .. }));
        registry.stop_server("s").await.unwrap();
        assert_eq!(lock_count(&registry), 0);

        registry
            .start_server("late", &sleeper(), &closed_port_url())
            .await
            .unwrap_err();
        assert_eq!(lock_count(&registry), 0);
    }

    #[tokio::test]
    async fn test_stop_of_absent_name_leaves_lock_free() {
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let (registry, _) = registry();

        let cmd = sleeper();
        let (stopped, started) = tokio::join!(
            registry.stop_server("s"),
            registry.start_server("s", &cmd, &url)
        );
        assert!(matches!(stopped.unwrap_err(), RegistryError::NotRunning { .. }));
        started.unwrap();
        assert!(registry.is_running("s"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_start_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let launch = LaunchCommand::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("echo $$ > {}; exec sleep 30", pid_file.display()),
            ],
        );
        let url = metadata_stub(json!({"tools": [{"name": "ping"}]})).await;
        let registry = ToolRegistry::new(config(Duration::from_millis(600)), Arc::new(StalledStore));

        let result = tokio::time::timeout(
            Duration::from_millis(1500),
            registry.start_server("s", &launch, &url),
        )
        .await;
        assert!(result.is_err(), "start finished despite a stalled store");

        assert_eq!(registry.state("s"), ServerState::Absent);
        assert_eq!(lock_count(&registry), 0);
        let pid = read_pid(&pid_file).await;
        assert!(wait_for_exit(pid).await, "process {} outlived the cancelled start", pid);
        assert!(matches!(
            registry.get_tools("s").await.unwrap_err(),
            RegistryError::NotFound { .. }
        ));
    }
}
