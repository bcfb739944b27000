//! Durable capability store.
//!
//! Records are keyed by `(name, server)`. Writes are insert-if-absent: a pair
//! that already exists is left untouched, never duplicated or overwritten.
//! Rows are never deleted by the registry, so they outlive server stops and
//! gateway restarts.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use super::errors::{RegistryError, RegistryResult};
use super::types::CapabilityRecord;

/// Persistent collection of capability records.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Insert every record whose `(name, server)` pair is not yet stored.
    ///
    /// All-or-nothing: on error, none of the records are written.
    /// Returns the number of newly inserted records.
    async fn insert_if_absent(&self, records: &[CapabilityRecord]) -> RegistryResult<usize>;

    /// All records owned by `server`, in first-registration order.
    async fn list_by_server(&self, server: &str) -> RegistryResult<Vec<CapabilityRecord>>;
}

/// SQLite-backed [`CapabilityStore`].
#[derive(Clone)]
pub struct SqliteCapabilityStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCapabilityStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| RegistryError::Store {
                    reason: format!("failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        tracing::info!("Opened capability store at {}", path.display());
        Self::init(conn)
    }

    /// In-memory store, for tests and throwaway gateways.
    pub fn open_in_memory() -> RegistryResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> RegistryResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS capabilities (
                name TEXT NOT NULL,
                server TEXT NOT NULL,
                document TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (name, server)
            );

            CREATE INDEX IF NOT EXISTS idx_capabilities_server
                ON capabilities(server);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> RegistryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> RegistryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| RegistryError::Store {
            reason: format!("store task failed: {}", e),
        })?
    }
}

#[async_trait]
impl CapabilityStore for SqliteCapabilityStore {
    async fn insert_if_absent(&self, records: &[CapabilityRecord]) -> RegistryResult<usize> {
        let rows = records
            .iter()
            .map(|r| -> RegistryResult<(String, String, String)> {
                Ok((r.name.clone(), r.server.clone(), serde_json::to_string(&r.metadata)?))
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let now = chrono::Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO capabilities (name, server, document, registered_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (name, server, document) in &rows {
                    inserted += stmt.execute(params![name, server, document, now])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn list_by_server(&self, server: &str) -> RegistryResult<Vec<CapabilityRecord>> {
        let server = server.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, server, document FROM capabilities
                 WHERE server = ?1
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![server], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (name, server, document) = row?;
                let metadata: Map<String, Value> = serde_json::from_str(&document)?;
                records.push(CapabilityRecord {
                    name,
                    server,
                    metadata,
                });
            }
            Ok(records)
        })
        .await
    }
}
