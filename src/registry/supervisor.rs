//! Tool server process supervision.
//!
//! The supervisor is the only owner of child process handles. Each name maps
//! to at most one slot, which moves through `Starting -> Running -> Stopping`
//! and is removed when the process is gone. The map lock is only held for
//! slot transitions, never across process spawn, health polling or shutdown,
//! so one slow server does not stall start/stop calls for other names.
//!
//! Each server runs in its own process group. Launch commands are often
//! wrappers (`npx`, `uv run`, `sh -c`) that fork the real server, so stop and
//! kill signal the whole group rather than the direct child alone.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::{RegistryError, RegistryResult};
use super::manifest::{FetchError, MetadataClient};
use super::types::{LaunchCommand, ServerInfo, ServerState};

/// Timing knobs for launching and stopping tool servers.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Overall deadline for the metadata endpoint to answer after spawn.
    pub health_timeout: Duration,
    /// Pause between failed metadata attempts.
    pub health_interval: Duration,
    /// Timeout for a single metadata request.
    pub request_timeout: Duration,
    /// How long a stopped process gets to exit after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(15),
            health_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// A running tool server and its OS process.
struct ServerProcess {
    name: String,
    launch: LaunchCommand,
    metadata_url: String,
    instance_id: Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    tree: ProcessTree,
}

impl ServerProcess {
    fn info(&self, state: ServerState) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            launch: self.launch.clone(),
            metadata_url: self.metadata_url.clone(),
            instance_id: self.instance_id,
            pid: self.tree.id(),
            state,
            started_at: self.started_at,
        }
    }
}

/// A spawned child and the process group it leads.
///
/// Dropping a tree that was never killed or terminated SIGKILLs the group.
struct ProcessTree {
    child: Child,
    pgid: Option<u32>,
    finished: bool,
}

impl ProcessTree {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Deliver `signal` to the group, or to the child if it has no group.
    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> bool {
        let target = match (self.pgid, self.child.id()) {
            (Some(pgid), _) => -(pgid as libc::pid_t),
            (None, Some(pid)) => pid as libc::pid_t,
            (None, None) => return false,
        };
        // SAFETY: the group was created for this child and outlives it while
        // any member is alive.
        unsafe { libc::kill(target, signal) == 0 }
    }

    /// SIGKILL the group and reap the child.
    async fn kill(&mut self, name: &str) {
        #[cfg(unix)]
        {
            self.signal(libc::SIGKILL);
        }
        if let Err(e) = self.child.kill().await {
            // Already exited and reaped.
            tracing::debug!(server = name, "Kill skipped: {}", e);
        }
        self.finished = true;
    }

    /// SIGTERM the group, wait up to `grace` for the child, then SIGKILL
    /// whatever is left of the group. Always reaps the child.
    async fn terminate(&mut self, name: &str, grace: Duration) {
        #[cfg(unix)]
        {
            if self.signal(libc::SIGTERM) {
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(server = name, %status, "Process exited after SIGTERM");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(server = name, "Failed to wait for process: {}", e);
                    }
                    Err(_) => {
                        tracing::warn!(
                            server = name,
                            "Process ignored SIGTERM for {}ms, killing",
                            grace.as_millis()
                        );
                    }
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.kill(name).await;
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if !self.finished {
                self.signal(libc::SIGKILL);
            }
        }
    }
}

enum Slot {
    Starting,
    Running(ServerProcess),
    Stopping,
}

impl Slot {
    fn state(&self) -> ServerState {
        match self {
            Self::Starting => ServerState::Starting,
            Self::Running(_) => ServerState::Running,
            Self::Stopping => ServerState::Stopping,
        }
    }
}

type SlotMap = HashMap<String, Slot>;

/// Removes a transitional slot when dropped, unless disarmed.
///
/// Keeps the map consistent if a start or stop future is cancelled midway.
struct SlotGuard<'a> {
    servers: &'a Mutex<SlotMap>,
    name: &'a str,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock_slots(self.servers).remove(self.name);
        }
    }
}

fn lock_slots(servers: &Mutex<SlotMap>) -> MutexGuard<'_, SlotMap> {
    servers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a successful start: the registered process and its manifest.
#[derive(Debug, Clone)]
pub struct StartedServer {
    pub info: ServerInfo,
    /// Raw capability descriptors, in manifest order.
    pub manifest: Vec<Value>,
}

/// Launches, health-gates and stops named tool server processes.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    metadata: MetadataClient,
    servers: Mutex<SlotMap>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let metadata = MetadataClient::new(config.request_timeout);
        Self {
            config,
            metadata,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, SlotMap> {
        lock_slots(&self.servers)
    }

    /// Spawn `launch` under `name` and wait for its metadata endpoint.
    ///
    /// Fails with `AlreadyRunning` if `name` has any entry. On every failure
    /// after spawn the process is killed and the entry removed.
    pub async fn start(
        &self,
        name: &str,
        launch: &LaunchCommand,
        metadata_url: &str,
    ) -> RegistryResult<StartedServer> {
        {
            let mut servers = self.slots();
            if servers.contains_key(name) {
                return Err(RegistryError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
            servers.insert(name.to_string(), Slot::Starting);
        }
        let guard = SlotGuard {
            servers: &self.servers,
            name,
            armed: true,
        };

        tracing::info!(server = name, command = %launch, "Starting tool server");
        let mut tree = spawn_child(name, launch)?;

        let manifest = match self.wait_until_ready(name, &mut tree.child, metadata_url).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tree.kill(name).await;
                tracing::warn!(server = name, "Tool server failed to start: {}", e);
                return Err(e);
            }
        };

        let process = ServerProcess {
            name: name.to_string(),
            launch: launch.clone(),
            metadata_url: metadata_url.to_string(),
            instance_id: Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            tree,
        };
        let info = process.info(ServerState::Running);
        self.slots().insert(name.to_string(), Slot::Running(process));
        guard.disarm();

        tracing::info!(
            server = name,
            pid = ?info.pid,
            tools = manifest.len(),
            "Tool server running"
        );
        Ok(StartedServer { info, manifest })
    }

    /// Poll the metadata endpoint until it yields a manifest or the deadline passes.
    async fn wait_until_ready(
        &self,
        name: &str,
        child: &mut Child,
        metadata_url: &str,
    ) -> RegistryResult<Vec<Value>> {
        let deadline = Instant::now() + self.config.health_timeout;
        let mut last_error: Option<FetchError> = None;
        let mut attempt = 0u32;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(RegistryError::ProcessExited {
                        name: name.to_string(),
                        status: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(server = name, "Failed to poll process status: {}", e);
                }
            }

            attempt += 1;
            match tokio::time::timeout_at(deadline, self.metadata.fetch(metadata_url)).await {
                Ok(Ok(manifest)) => {
                    tracing::debug!(server = name, attempt, "Metadata endpoint answered");
                    return Ok(manifest);
                }
                Ok(Err(e)) => {
                    tracing::debug!(server = name, attempt, "Metadata not ready: {}", e);
                    last_error = Some(e);
                }
                Err(_) => break,
            }

            let next = Instant::now() + self.config.health_interval;
            if next >= deadline {
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        Err(match last_error {
            Some(FetchError::BadResponse(reason)) => RegistryError::UpstreamMetadataError {
                name: name.to_string(),
                reason,
            },
            _ => RegistryError::HealthCheckTimeout {
                name: name.to_string(),
                url: metadata_url.to_string(),
                timeout_ms: duration_ms(self.config.health_timeout),
            },
        })
    }

    /// Terminate the process registered under `name` and remove its entry.
    ///
    /// Succeeds even if the process had already exited on its own.
    pub async fn stop(&self, name: &str) -> RegistryResult<ServerInfo> {
        let mut process = {
            let mut servers = self.slots();
            match servers.remove(name) {
                Some(Slot::Running(process)) => {
                    servers.insert(name.to_string(), Slot::Stopping);
                    process
                }
                Some(other) => {
                    servers.insert(name.to_string(), other);
                    return Err(RegistryError::NotRunning {
                        name: name.to_string(),
                    });
                }
                None => {
                    return Err(RegistryError::NotRunning {
                        name: name.to_string(),
                    })
                }
            }
        };
        let _guard = SlotGuard {
            servers: &self.servers,
            name,
            armed: true,
        };

        let info = process.info(ServerState::Stopping);
        tracing::info!(server = name, pid = ?info.pid, "Stopping tool server");
        process.tree.terminate(name, self.config.stop_grace).await;
        tracing::info!(server = name, "Tool server stopped");

        Ok(ServerInfo {
            state: ServerState::Absent,
            ..info
        })
    }

    /// Drop a running entry without waiting for the process to exit.
    ///
    /// The process group is SIGKILLed as the handle drops. For callers that
    /// cannot await, such as a cancelled start being unwound.
    pub fn abort(&self, name: &str) -> bool {
        let removed = {
            let mut servers = self.slots();
            match servers.get(name) {
                Some(Slot::Running(_)) => servers.remove(name),
                _ => None,
            }
        };
        match removed {
            Some(_) => {
                tracing::warn!(server = name, "Tool server aborted");
                true
            }
            None => false,
        }
    }

    /// Stop every running server. Used on gateway shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(name, _)| name.clone())
            .collect();

        if names.is_empty() {
            return;
        }
        tracing::info!("Stopping {} tool server(s)", names.len());

        let results = futures::future::join_all(names.iter().map(|name| self.stop(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server = %name, "Failed to stop during shutdown: {}", e);
            }
        }
    }

    /// True only when `name` has completed its health check and is not stopping.
    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.slots().get(name), Some(Slot::Running(_)))
    }

    pub fn state(&self, name: &str) -> ServerState {
        self.slots()
            .get(name)
            .map(Slot::state)
            .unwrap_or(ServerState::Absent)
    }

    /// Snapshot of all running servers, sorted by name.
    pub fn list(&self) -> Vec<ServerInfo> {
        let mut infos: Vec<ServerInfo> = self
            .slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(process) => Some(process.info(ServerState::Running)),
                _ => None,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn running_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }
}

fn spawn_child(name: &str, launch: &LaunchCommand) -> RegistryResult<ProcessTree> {
    let mut cmd = Command::new(&launch.command);
    cmd.args(&launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // New group led by the child, so its descendants can be signalled together.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| RegistryError::SpawnError {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(stdout) = child.stdout.take() {
        forward_output(name, "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(name, "stderr", stderr);
    }

    let pgid = if cfg!(unix) { child.id() } else { None };
    Ok(ProcessTree {
        child,
        pgid,
        finished: false,
    })
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Copy a child's output stream into the gateway log, line by line.
fn forward_output<R>(name: &str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, stream, "{}", line);
        }
    });
}
