//! Supervisor for user-owned MCP servers.
//!
//! Holds one registry per user, each mapping `server_id` to a live
//! [`McpClient`]. Mutating operations (add, remove, reconcile) are
//! serialized per user; reads work on snapshots. Tool names are exposed to
//! the model fully qualified as `"<server_id>__MCP__<tool>"` so collisions
//! across servers cannot occur.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use relay_mcp_client::ClientState;
use relay_mcp_client::McpClient;
use relay_mcp_client::SpawnSpec;
use relay_mcp_types::CallToolResult;
use relay_protocol::ServerSpec;
use relay_protocol::ServerStatus;
use relay_protocol::ServerSummary;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::error::RelayErr;
use crate::error::Result;
use crate::store::ConfigStore;
use crate::util::lock_ignoring_poison;
use crate::validate::validate_spec;

/// Separates the server id from the tool name in a fully qualified tool
/// name. Server ids may themselves contain `_` and `-`, so the delimiter has
/// to be something the id charset cannot accidentally produce next to a
/// plausible tool name.
const TOOL_NAME_DELIMITER: &str = "__MCP__";

pub fn fully_qualified_tool_name(server_id: &str, tool: &str) -> String {
    format!("{server_id}{TOOL_NAME_DELIMITER}{tool}")
}

pub fn try_parse_fully_qualified_tool_name(fq_name: &str) -> Option<(String, String)> {
    let (server, tool) = fq_name.split_once(TOOL_NAME_DELIMITER)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server.to_string(), tool.to_string()))
}

/// A tool descriptor annotated with its owning server.
#[derive(Debug, Clone)]
pub struct QualifiedTool {
    pub qualified_name: String,
    pub server_id: String,
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Timing knobs for client lifecycle, bundled so tests can shrink them.
#[derive(Debug, Clone)]
pub struct SupervisorTimeouts {
    pub handshake: Duration,
    pub tool_call: Duration,
    pub drain_window: Duration,
}

impl Default for SupervisorTimeouts {
    fn default() -> Self {
        Self {
            handshake: *crate::flags::RELAY_MCP_HANDSHAKE_TIMEOUT_MS,
            tool_call: *crate::flags::RELAY_MCP_TOOL_TIMEOUT_MS,
            drain_window: *crate::flags::RELAY_MCP_DRAIN_WINDOW_MS,
        }
    }
}

struct UserRegistry {
    /// Serializes add/remove/reconcile for one user.
    mutate: tokio::sync::Mutex<bool>, // true once reconciled
    clients: Mutex<HashMap<String, Arc<McpClient>>>,
    /// Server ids whose reconcile spawn failed; persisted specs in this set
    /// are reported as `failed` rather than `registered`.
    failed: Mutex<HashSet<String>>,
}

impl UserRegistry {
    fn new() -> Self {
        Self {
            mutate: tokio::sync::Mutex::new(false),
            clients: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    fn snapshot(&self) -> HashMap<String, Arc<McpClient>> {
        lock_ignoring_poison(&self.clients).clone()
    }
}

pub struct McpSupervisor {
    store: Arc<dyn ConfigStore>,
    users: Mutex<HashMap<String, Arc<UserRegistry>>>,
    scratch_root: PathBuf,
    timeouts: SupervisorTimeouts,
}

impl McpSupervisor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        scratch_root: PathBuf,
        timeouts: SupervisorTimeouts,
    ) -> Self {
        Self {
            store,
            users: Mutex::new(HashMap::new()),
            scratch_root,
            timeouts,
        }
    }

    fn registry_for(&self, user_id: &str) -> Arc<UserRegistry> {
        let mut users = lock_ignoring_poison(&self.users);
        Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(UserRegistry::new())),
        )
    }

    fn spawn_spec_for(&self, user_id: &str, spec: &ServerSpec) -> SpawnSpec {
        SpawnSpec {
            program: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: self.scratch_root.join(user_id),
        }
    }

    /// Re-spawn clients for every persisted spec of this user. Runs once per
    /// process lifetime per user, on first access; individual failures are
    /// reported and do not block the other servers.
    pub async fn startup_reconcile(&self, user_id: &str) -> Result<Vec<(String, RelayErr)>> {
        let registry = self.registry_for(user_id);
        let mut reconciled = registry.mutate.lock().await;
        if *reconciled {
            return Ok(Vec::new());
        }

        let specs = self.store.list(user_id).await?;
        let mut join_set = JoinSet::new();
        for spec in specs {
            let spawn = self.spawn_spec_for(user_id, &spec);
            let timeouts = self.timeouts.clone();
            join_set.spawn(async move {
                let client =
                    McpClient::connect(spawn, timeouts.handshake, timeouts.tool_call).await;
                (spec.server_id, client)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((server_id, client_res)) = joined else {
                continue;
            };
            match client_res {
                Ok(client) => {
                    lock_ignoring_poison(&registry.clients)
                        .insert(server_id, Arc::new(client));
                }
                Err(e) => {
                    warn!(server_id, "failed to reconcile MCP server: {e}");
                    lock_ignoring_poison(&registry.failed).insert(server_id.clone());
                    failures.push((server_id, RelayErr::from(e)));
                }
            }
        }

        *reconciled = true;
        info!(
            user_id,
            live = lock_ignoring_poison(&registry.clients).len(),
            failed = failures.len(),
            "startup reconcile complete"
        );
        Ok(failures)
    }

    /// Register and start one server: validate, persist, spawn, expose. The
    /// persist happens before the spawn so a crash in between cannot leave
    /// an orphan process; a spawn failure rolls the persist back.
    pub async fn add(&self, user_id: &str, spec: ServerSpec) -> Result<()> {
        validate_spec(&spec)?;

        let registry = self.registry_for(user_id);
        let _guard = registry.mutate.lock().await;

        self.store.put(user_id, &spec).await?;

        let spawn = self.spawn_spec_for(user_id, &spec);
        let client =
            match McpClient::connect(spawn, self.timeouts.handshake, self.timeouts.tool_call).await
            {
                Ok(client) => client,
                Err(e) => {
                    if let Err(rollback) = self.store.delete(user_id, &spec.server_id).await {
                        warn!(
                            server_id = spec.server_id,
                            "rollback after spawn failure also failed: {rollback}"
                        );
                    }
                    return Err(e.into());
                }
            };

        lock_ignoring_poison(&registry.failed).remove(&spec.server_id);
        let previous = lock_ignoring_poison(&registry.clients)
            .insert(spec.server_id.clone(), Arc::new(client));
        if let Some(previous) = previous {
            // Same-id re-registration replaces the row; the displaced
            // client is drained in the background.
            let drain = self.timeouts.drain_window;
            tokio::spawn(async move { previous.shutdown(drain).await });
        }
        info!(user_id, server_id = spec.server_id, "MCP server registered");
        Ok(())
    }

    /// Stop and unregister. Idempotent; close errors are logged and never
    /// block the delete.
    pub async fn remove(&self, user_id: &str, server_id: &str) -> Result<()> {
        let registry = self.registry_for(user_id);
        let _guard = registry.mutate.lock().await;

        let client = lock_ignoring_poison(&registry.clients).remove(server_id);
        lock_ignoring_poison(&registry.failed).remove(server_id);
        if let Some(client) = client {
            client.shutdown(self.timeouts.drain_window).await;
        }
        self.store.delete(user_id, server_id).await?;
        info!(user_id, server_id, "MCP server removed");
        Ok(())
    }

    /// Union of persisted specs and live clients, annotated with status.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ServerSummary>> {
        let specs = self.store.list(user_id).await?;
        let registry = self.registry_for(user_id);
        let clients = registry.snapshot();
        let failed = lock_ignoring_poison(&registry.failed).clone();

        Ok(specs
            .into_iter()
            .map(|spec| {
                let status = match clients.get(&spec.server_id).map(|c| c.state()) {
                    Some(ClientState::Ready) => ServerStatus::Ready,
                    Some(ClientState::Init | ClientState::Starting) => ServerStatus::Connecting,
                    Some(ClientState::Failed | ClientState::Closing | ClientState::Closed) => {
                        ServerStatus::Failed
                    }
                    None if failed.contains(&spec.server_id) => ServerStatus::Failed,
                    None => ServerStatus::Registered,
                };
                ServerSummary {
                    server_id: spec.server_id,
                    server_name: spec.server_name,
                    command: spec.command,
                    args: spec.args,
                    status,
                }
            })
            .collect())
    }

    /// Flat tool list across the requested subset of the user's servers.
    /// Servers that are not ready contribute nothing; a request naming an
    /// unknown server id is an error so typos surface instead of silently
    /// shrinking the tool set.
    pub async fn tools_for(
        &self,
        user_id: &str,
        enabled_ids: &[String],
    ) -> Result<Vec<QualifiedTool>> {
        let clients = self.registry_for(user_id).snapshot();

        let mut tools = Vec::new();
        for server_id in enabled_ids {
            let Some(client) = clients.get(server_id) else {
                return Err(RelayErr::UnknownServer(server_id.clone()));
            };
            if client.state() != ClientState::Ready {
                warn!(server_id, state = client.state().as_str(), "skipping tools");
                continue;
            }
            for tool in client.tools().await? {
                tools.push(QualifiedTool {
                    qualified_name: fully_qualified_tool_name(server_id, &tool.name),
                    server_id: server_id.clone(),
                    tool_name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        Ok(tools)
    }

    /// Invoke the tool indicated by the (server, tool) pair.
    pub async fn call_tool(
        &self,
        user_id: &str,
        server_id: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let client = {
            let clients = self.registry_for(user_id).snapshot();
            clients
                .get(server_id)
                .cloned()
                .ok_or_else(|| RelayErr::UnknownServer(server_id.to_string()))?
        };
        let timeout = timeout.or(Some(self.timeouts.tool_call));
        Ok(client.call_tool(tool.to_string(), arguments, timeout).await?)
    }

    /// Close every client of every user within the drain window. Used on
    /// process shutdown.
    pub async fn shutdown(&self) {
        let registries: Vec<Arc<UserRegistry>> = {
            let users = lock_ignoring_poison(&self.users);
            users.values().cloned().collect()
        };

        let mut join_set = JoinSet::new();
        for registry in registries {
            for (_, client) in registry.snapshot() {
                let drain = self.timeouts.drain_window;
                join_set.spawn(async move { client.shutdown(drain).await });
            }
        }
        while join_set.join_next().await.is_some() {}
        info!("MCP supervisor shut down");
    }
}
