//! Durable per-user registry of MCP server specs.
//!
//! One table, primary key `(user_id, server_id)`, one JSON `spec` column.
//! Only validated specs reach this layer, and the supervisor never spawns a
//! subprocess before the corresponding `put` has been acknowledged, so a
//! crash between "spawned" and "persisted" cannot leave orphans.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use relay_protocol::ServerSpec;
use rusqlite::Connection;
use rusqlite::params;
use thiserror::Error;

use crate::util::lock_ignoring_poison;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The persistence layer is unreachable or misbehaving. Mutating
    /// endpoints fail; in-memory state keeps serving.
    #[error("config store unavailable: {0}")]
    Unavailable(String),

    #[error("stored spec is not decodable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Upsert; `(user_id, server_id)` is the primary key, so re-adding the
    /// same id replaces the row.
    async fn put(&self, user_id: &str, spec: &ServerSpec) -> Result<(), StoreError>;

    /// Idempotent; deleting an absent row succeeds.
    async fn delete(&self, user_id: &str, server_id: &str) -> Result<(), StoreError>;

    async fn list(&self, user_id: &str) -> Result<Vec<ServerSpec>, StoreError>;

    async fn get(&self, user_id: &str, server_id: &str) -> Result<Option<ServerSpec>, StoreError>;
}

/// SQLite-backed store. rusqlite is synchronous, so every call hops onto the
/// blocking pool; the connection itself is serialized behind a mutex, which
/// is plenty for a registry mutated a few times per user session.
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mcp_servers (
                user_id   TEXT NOT NULL,
                server_id TEXT NOT NULL,
                spec      TEXT NOT NULL,
                PRIMARY KEY (user_id, server_id)
            )",
            [],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = lock_ignoring_poison(&conn);
            f(&conn).map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn put(&self, user_id: &str, spec: &ServerSpec) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let server_id = spec.server_id.clone();
        let json = serde_json::to_string(spec)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO mcp_servers (user_id, server_id, spec) VALUES (?1, ?2, ?3)",
                params![user_id, server_id, json],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, user_id: &str, server_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let server_id = server_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM mcp_servers WHERE user_id = ?1 AND server_id = ?2",
                params![user_id, server_id],
            )
            .map(|_| ())
        })
        .await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ServerSpec>, StoreError> {
        let user_id = user_id.to_string();
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT spec FROM mcp_servers WHERE user_id = ?1 ORDER BY server_id",
                )?;
                let rows = stmt
                    .query_map(params![user_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn get(&self, user_id: &str, server_id: &str) -> Result<Option<ServerSpec>, StoreError> {
        let user_id = user_id.to_string();
        let server_id = server_id.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT spec FROM mcp_servers WHERE user_id = ?1 AND server_id = ?2",
                )?;
                let mut rows = stmt.query_map(params![user_id, server_id], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.next().transpose()
            })
            .await?;
        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// In-memory store for tests and single-process development runs.
#[derive(Default)]
pub struct MemoryConfigStore {
    rows: Mutex<HashMap<(String, String), ServerSpec>>,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn put(&self, user_id: &str, spec: &ServerSpec) -> Result<(), StoreError> {
        lock_ignoring_poison(&self.rows).insert(
            (user_id.to_string(), spec.server_id.clone()),
            spec.clone(),
        );
        Ok(())
    }

    async fn delete(&self, user_id: &str, server_id: &str) -> Result<(), StoreError> {
        lock_ignoring_poison(&self.rows)
            .remove(&(user_id.to_string(), server_id.to_string()));
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ServerSpec>, StoreError> {
        let rows = lock_ignoring_poison(&self.rows);
        let mut specs: Vec<ServerSpec> = rows
            .iter()
            .filter(|((uid, _), _)| uid == user_id)
            .map(|(_, spec)| spec.clone())
            .collect();
        specs.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(specs)
    }

    async fn get(&self, user_id: &str, server_id: &str) -> Result<Option<ServerSpec>, StoreError> {
        Ok(lock_ignoring_poison(&self.rows)
            .get(&(user_id.to_string(), server_id.to_string()))
            .cloned())
    }
}
